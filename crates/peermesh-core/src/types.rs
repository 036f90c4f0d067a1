//! Core types for the peer-network core

pub mod connection;
pub mod peer;
pub mod resource;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

pub use connection::{Connection, ConnectionEvent, ConnectionStatus};
pub use peer::{Peer, PeerDescriptor, PeerStatus};
pub use resource::ResourceSample;

/// Stable identifier of a peer
///
/// Always derived from the peer's public key with SHA-256, rendered as lowercase
/// hex, so registering the same key twice yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the id for a public key
    pub fn from_public_key(public_key: &str) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap an already-derived id (e.g. read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a connection record
///
/// Uses ULID so ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Ulid);

impl ConnectionId {
    /// Create a new ConnectionId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_sha256_hex() {
        let id = PeerId::from_public_key("abc123");
        assert_eq!(
            id.as_str(),
            "6ca13d52ca70c883e0f0bb101e425a89e8624de51db2d2392593af6a84118090"
        );
    }

    #[test]
    fn test_peer_id_deterministic() {
        assert_eq!(PeerId::from_public_key("k"), PeerId::from_public_key("k"));
        assert_ne!(PeerId::from_public_key("k"), PeerId::from_public_key("j"));
    }

    #[test]
    fn test_peer_id_short() {
        let id = PeerId::from_public_key("abc123");
        assert_eq!(id.short(), "6ca13d52");
        assert_eq!(PeerId::from_raw("abc").short(), "abc");
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
