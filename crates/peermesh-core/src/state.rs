//! The coordinating lock
//!
//! Peers and connections live behind one mutex so that add/remove, timeout
//! handling and inbound signaling never observe a peer without its connection
//! (or the reverse). The lock is never held across an `.await`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionTable;
use crate::directory::PeerDirectory;
use crate::storage::Records;

pub struct MeshState {
    pub directory: PeerDirectory,
    pub connections: ConnectionTable,
}

pub type SharedState = Arc<Mutex<MeshState>>;

impl MeshState {
    pub fn new(directory: PeerDirectory, records: Records) -> Self {
        Self {
            directory,
            connections: ConnectionTable::new(records),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }
}
