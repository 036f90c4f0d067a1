//! Typed record access over a [`RecordStore`]
//!
//! Layout (all values are JSON):
//!
//! | table         | key                                   | value              |
//! |---------------|---------------------------------------|--------------------|
//! | `peers`       | peer id                               | [`Peer`]           |
//! | `connections` | peer id (one connection per peer)     | [`Connection`]     |
//! | `resources`   | `{peerId}/{updatedMs:020}/{ulid}`     | [`ResourceSample`] |
//! | `sync_state`  | `state`                               | [`SyncState`]      |

use std::sync::Arc;

use ulid::Ulid;

use super::{RecordStore, Table};
use crate::error::MeshError;
use crate::sync::SyncState;
use crate::types::{Connection, Peer, PeerId, ResourceSample};

/// Key under which locally sampled resources are stored
pub const LOCAL_SAMPLE_KEY: &str = "local";

const SYNC_STATE_KEY: &str = "state";

/// Typed view of the record store shared by all components
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn RecordStore>,
}

impl Records {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// The untyped store behind this view
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_peer(&self, peer: &Peer) -> Result<(), MeshError> {
        let data = serde_json::to_vec(peer)?;
        self.store.upsert(Table::Peers, peer.id.as_str(), &data)
    }

    pub fn load_peer(&self, peer_id: &PeerId) -> Result<Option<Peer>, MeshError> {
        match self.store.get(Table::Peers, peer_id.as_str())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>, MeshError> {
        self.store
            .scan_prefix(Table::Peers, "")?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice(&data).map_err(MeshError::from))
            .collect()
    }

    /// Delete a peer together with its connection and resource samples
    pub fn delete_peer_cascade(&self, peer_id: &PeerId) -> Result<(), MeshError> {
        self.store.delete(Table::Connections, peer_id.as_str())?;
        self.store
            .delete_prefix(Table::Resources, &Self::sample_prefix(peer_id.as_str()))?;
        self.store.delete(Table::Peers, peer_id.as_str())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_connection(&self, connection: &Connection) -> Result<(), MeshError> {
        let data = serde_json::to_vec(connection)?;
        self.store
            .upsert(Table::Connections, connection.peer_id.as_str(), &data)
    }

    pub fn load_connection(&self, peer_id: &PeerId) -> Result<Option<Connection>, MeshError> {
        match self.store.get(Table::Connections, peer_id.as_str())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn delete_connection(&self, peer_id: &PeerId) -> Result<(), MeshError> {
        self.store.delete(Table::Connections, peer_id.as_str())
    }

    /// Drop every connection record; links never survive a restart
    pub fn clear_connections(&self) -> Result<(), MeshError> {
        self.store.delete_prefix(Table::Connections, "")?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resource samples
    // ═══════════════════════════════════════════════════════════════════════

    fn sample_prefix(owner: &str) -> String {
        format!("{owner}/")
    }

    /// Append a sample; `owner` is a peer id or [`LOCAL_SAMPLE_KEY`]
    pub fn append_sample(&self, owner: &str, sample: &ResourceSample) -> Result<(), MeshError> {
        let key = format!("{owner}/{:020}/{}", sample.updated.max(0), Ulid::new());
        let data = serde_json::to_vec(sample)?;
        self.store.upsert(Table::Resources, &key, &data)
    }

    /// Samples for one owner, oldest first
    pub fn list_samples(&self, owner: &str) -> Result<Vec<ResourceSample>, MeshError> {
        self.store
            .scan_prefix(Table::Resources, &Self::sample_prefix(owner))?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice(&data).map_err(MeshError::from))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync state
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_sync_state(&self, state: &SyncState) -> Result<(), MeshError> {
        let data = serde_json::to_vec(state)?;
        self.store.upsert(Table::SyncState, SYNC_STATE_KEY, &data)
    }

    pub fn load_sync_state(&self) -> Result<Option<SyncState>, MeshError> {
        match self.store.get(Table::SyncState, SYNC_STATE_KEY)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
