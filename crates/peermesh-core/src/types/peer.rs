//! Peer records
//!
//! A [`Peer`] is a remote participant identified by its public key. Records are
//! created from a [`PeerDescriptor`] (manual add, discovery, or an inbound
//! `PEER_ANNOUNCE`) and owned by the peer directory.

use serde::{Deserialize, Serialize};

use super::{now_millis, PeerId};

/// Trust score assigned on first registration
pub const BASELINE_TRUST: f64 = 1.0;

/// Lifecycle status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Registered but never connected
    #[default]
    New,
    /// A supervised connection is up
    Connected,
    /// Previously connected, link currently down
    Disconnected,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::New => write!(f, "new"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// What a caller knows about a peer before it is registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach opaque metadata (addresses, versions, ...)
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The id this descriptor registers under
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }
}

/// Persisted peer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Unix millis of the last successful contact
    pub last_seen: i64,
    /// Stored and exposed only; nothing in this crate mutates it
    pub trust_score: f64,
    pub status: PeerStatus,
}

impl Peer {
    /// Create a fresh record from a descriptor
    pub fn from_descriptor(descriptor: PeerDescriptor) -> Self {
        Self {
            id: descriptor.peer_id(),
            name: descriptor.name,
            public_key: descriptor.public_key,
            metadata: descriptor.metadata,
            last_seen: now_millis(),
            trust_score: BASELINE_TRUST,
            status: PeerStatus::New,
        }
    }

    /// Update the last_seen timestamp to now
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    /// Refresh descriptive fields from a newer announcement
    pub fn refresh(&mut self, descriptor: &PeerDescriptor) {
        self.name = descriptor.name.clone();
        if !descriptor.metadata.is_null() {
            self.metadata = descriptor.metadata.clone();
        }
        self.touch();
    }
}
