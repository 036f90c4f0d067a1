//! Network event types
//!
//! Components publish [`NetworkEvent`]s on a tokio broadcast channel so the
//! surrounding application (UI, CLI, tests) can observe the network without
//! holding any of its locks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  NetworkEvent                                                   │
//! │  ├── PeerAdded / PeerRemoved: directory membership changed      │
//! │  ├── ConnectionChanged: supervisor state machine moved          │
//! │  ├── RetriesExhausted: no further automatic re-establishment    │
//! │  ├── ResourceReported: a RESOURCE_UPDATE was recorded           │
//! │  └── SyncCompleted: a sync pass finished                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use tokio::sync::broadcast;

use crate::types::{ConnectionStatus, PeerId};

/// Default capacity for the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications about network activity
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    PeerAdded {
        peer_id: PeerId,
        name: String,
    },
    PeerRemoved {
        peer_id: PeerId,
    },
    ConnectionChanged {
        peer_id: PeerId,
        status: ConnectionStatus,
    },
    /// The retry budget for this peer's connection is spent
    RetriesExhausted {
        peer_id: PeerId,
        retries: u32,
    },
    /// A resource sample was recorded (`None` = local sample)
    ResourceReported {
        peer_id: Option<PeerId>,
    },
    SyncCompleted {
        synced: usize,
        failed: usize,
    },
}

/// Cloneable publishing half of the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is not an error
    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
