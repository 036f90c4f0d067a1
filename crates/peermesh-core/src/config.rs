//! Network configuration
//!
//! Every knob has a default; a JSON file may override any subset of them
//! (camelCase keys, e.g. `{"maxPeers": 25, "retryDelayMs": 500}`).

use std::path::Path;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::PeerId;

/// Public STUN server used when no ICE servers are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// mDNS service type announced and browsed by discovery
pub const DEFAULT_SERVICE_TYPE: &str = "_peermesh._tcp.local.";

/// What to do with a peer once its connection has used up `maxRetries`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExhaustedPolicy {
    /// Leave the connection `closed`; callers poll status
    #[default]
    KeepClosed,
    /// Remove the peer (and its records) from the directory
    EvictPeer,
}

/// The local node's identity as announced to others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub name: String,
    pub public_key: String,
}

impl LocalIdentity {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "peermesh-node".into());

        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);

        Self {
            name,
            public_key: hex::encode(key),
        }
    }
}

/// Configuration consumed by every component of the peer network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    pub identity: LocalIdentity,
    pub max_peers: usize,
    pub max_connections: usize,
    pub max_pending_connections: usize,
    pub max_message_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub discovery_interval_ms: u64,
    pub discovery_window_ms: u64,
    pub resource_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub sync_timeout_ms: u64,
    pub exhausted_policy: ExhaustedPolicy,
    pub ice_servers: Vec<String>,
    pub service_type: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identity: LocalIdentity::default(),
            max_peers: 10,
            max_connections: 20,
            max_pending_connections: 5,
            max_message_size: 1024 * 1024,
            max_retries: 3,
            retry_delay_ms: 1_000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 10_000,
            discovery_interval_ms: 60_000,
            discovery_window_ms: 3_000,
            resource_interval_ms: 60_000,
            sync_interval_ms: 300_000,
            sync_timeout_ms: 10_000,
            exhausted_policy: ExhaustedPolicy::KeepClosed,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}

impl MeshConfig {
    /// Load overrides from a JSON file and validate the result
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: MeshConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the supervisor or timers degenerate
    pub fn validate(&self) -> MeshResult<()> {
        let non_zero = [
            ("maxPeers", self.max_peers as u64),
            ("maxConnections", self.max_connections as u64),
            ("maxPendingConnections", self.max_pending_connections as u64),
            ("maxMessageSize", self.max_message_size as u64),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("connectionTimeoutMs", self.connection_timeout_ms),
            ("discoveryIntervalMs", self.discovery_interval_ms),
            ("resourceIntervalMs", self.resource_interval_ms),
            ("syncIntervalMs", self.sync_interval_ms),
            ("syncTimeoutMs", self.sync_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(MeshError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.identity.public_key.is_empty() {
            return Err(MeshError::Config("identity.publicKey must not be empty".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_millis(self.resource_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Linear backoff: `retryDelay * attempt`, where `attempt` is the
    /// already-incremented retry counter. Saturates at `Duration::MAX`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_delay().saturating_mul(attempt)
    }
}
