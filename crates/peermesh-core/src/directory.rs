//! Peer directory
//!
//! Holds every known peer, enforces the `maxPeers` population limit and writes
//! peer records through to the record store. The directory is the only
//! component that creates or deletes [`Peer`] records; the connection
//! supervisor may update `status`/`lastSeen` through [`PeerDirectory::mark`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Registration Flow                                              │
//! │  1. Manual add, discovery hit or PEER_ANNOUNCE                  │
//! │  2. id = sha256(publicKey)                                      │
//! │  3. Known id → refresh name/metadata/lastSeen                   │
//! │  4. New id → limit check, persist with status = new            │
//! │  5. Caller asks the supervisor to initialize a connection       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{MeshError, MeshResult};
use crate::storage::Records;
use crate::types::{Peer, PeerDescriptor, PeerId, PeerStatus};

/// Outcome of [`PeerDirectory::add_peer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub peer_id: PeerId,
    /// `false` when the key was already known and the record was refreshed
    pub created: bool,
}

/// In-memory peer table with write-through persistence
pub struct PeerDirectory {
    peers: HashMap<PeerId, Peer>,
    max_peers: usize,
    records: Records,
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new(max_peers: usize, records: Records) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            records,
        }
    }

    /// Create a directory pre-populated from the record store
    pub fn load(max_peers: usize, records: Records) -> MeshResult<Self> {
        let mut directory = Self::new(max_peers, records);
        for peer in directory.records.list_peers()? {
            directory.peers.insert(peer.id.clone(), peer);
        }
        if !directory.peers.is_empty() {
            info!(count = directory.peers.len(), "Restored peers from storage");
        }
        Ok(directory)
    }

    /// Register a peer, or refresh it if its key is already known.
    ///
    /// # Errors
    ///
    /// `PeerLimitExceeded` when the key is new and `maxPeers` peers are
    /// already registered. Nothing is mutated in that case.
    pub fn add_peer(&mut self, descriptor: PeerDescriptor) -> MeshResult<Registration> {
        let peer_id = descriptor.peer_id();

        if let Some(existing) = self.peers.get_mut(&peer_id) {
            existing.refresh(&descriptor);
            self.records.save_peer(existing)?;
            debug!(peer_id = %peer_id.short(), "Refreshed known peer");
            return Ok(Registration {
                peer_id,
                created: false,
            });
        }

        if self.peers.len() >= self.max_peers {
            return Err(MeshError::PeerLimitExceeded {
                max: self.max_peers,
            });
        }

        let peer = Peer::from_descriptor(descriptor);
        self.records.save_peer(&peer)?;
        info!(peer_id = %peer_id.short(), name = %peer.name, "Registered peer");
        self.peers.insert(peer_id.clone(), peer);

        Ok(Registration {
            peer_id,
            created: true,
        })
    }

    /// Remove a peer and cascade-delete its connection and resource records.
    ///
    /// Idempotent: unknown ids return `Ok(None)`.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> MeshResult<Option<Peer>> {
        self.records.delete_peer_cascade(peer_id)?;
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            info!(peer_id = %peer_id.short(), "Removed peer");
        }
        Ok(removed)
    }

    /// Update status and stamp `lastSeen`; no-op for unknown ids
    pub fn mark(&mut self, peer_id: &PeerId, status: PeerStatus) -> MeshResult<()> {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.status = status;
            peer.touch();
            self.records.save_peer(peer)?;
        }
        Ok(())
    }

    /// Stamp `lastSeen` without changing status
    pub fn touch(&mut self, peer_id: &PeerId) -> MeshResult<()> {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.touch();
            self.records.save_peer(peer)?;
        }
        Ok(())
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot of all peers
    pub fn list(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, Storage};
    use crate::types::{Connection, ResourceSample};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_directory(max_peers: usize) -> (PeerDirectory, Records) {
        let records = Records::new(Arc::new(MemoryStore::new()));
        (PeerDirectory::new(max_peers, records.clone()), records)
    }

    #[test]
    fn test_add_peer_persists() {
        let (mut dir, records) = create_test_directory(10);

        let reg = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();

        assert!(reg.created);
        assert_eq!(reg.peer_id, PeerId::from_public_key("abc123"));
        let stored = records.load_peer(&reg.peer_id).unwrap().unwrap();
        assert_eq!(stored.status, PeerStatus::New);
        assert_eq!(stored.trust_score, 1.0);
    }

    #[test]
    fn test_same_key_same_id() {
        let (mut dir, _) = create_test_directory(10);

        let first = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();
        let second = dir.add_peer(PeerDescriptor::new("Alice 2", "abc123")).unwrap();

        assert_eq!(first.peer_id, second.peer_id);
        assert!(!second.created);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(&first.peer_id).unwrap().name, "Alice 2");
    }

    #[test]
    fn test_peer_limit() {
        let (mut dir, _) = create_test_directory(10);
        for i in 0..10 {
            dir.add_peer(PeerDescriptor::new(format!("p{i}"), format!("key-{i}")))
                .unwrap();
        }

        let result = dir.add_peer(PeerDescriptor::new("eleventh", "key-10"));

        assert!(matches!(
            result,
            Err(MeshError::PeerLimitExceeded { max: 10 })
        ));
        assert_eq!(dir.len(), 10);
    }

    #[test]
    fn test_known_key_refreshes_even_when_full() {
        let (mut dir, _) = create_test_directory(1);
        dir.add_peer(PeerDescriptor::new("Alice", "a")).unwrap();

        assert!(dir.add_peer(PeerDescriptor::new("Alice", "a")).is_ok());
        assert!(dir.add_peer(PeerDescriptor::new("Bob", "b")).is_err());
    }

    #[test]
    fn test_remove_is_idempotent_and_cascades() {
        let (mut dir, records) = create_test_directory(10);
        let reg = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();
        records
            .save_connection(&Connection::new(reg.peer_id.clone()))
            .unwrap();
        records
            .append_sample(reg.peer_id.as_str(), &ResourceSample::empty())
            .unwrap();

        assert!(dir.remove_peer(&reg.peer_id).unwrap().is_some());
        assert!(dir.remove_peer(&reg.peer_id).unwrap().is_none());
        assert!(records.load_connection(&reg.peer_id).unwrap().is_none());
        assert!(records.list_samples(reg.peer_id.as_str()).unwrap().is_empty());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_re_add_after_remove_is_new() {
        let (mut dir, _) = create_test_directory(10);
        let reg = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();
        dir.mark(&reg.peer_id, PeerStatus::Connected).unwrap();
        dir.remove_peer(&reg.peer_id).unwrap();

        let again = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();

        assert!(again.created);
        assert_eq!(dir.get(&again.peer_id).unwrap().status, PeerStatus::New);
    }

    #[test]
    fn test_mark_updates_status() {
        let (mut dir, records) = create_test_directory(10);
        let reg = dir.add_peer(PeerDescriptor::new("Alice", "abc123")).unwrap();

        dir.mark(&reg.peer_id, PeerStatus::Connected).unwrap();

        let stored = records.load_peer(&reg.peer_id).unwrap().unwrap();
        assert_eq!(stored.status, PeerStatus::Connected);

        // Unknown ids are ignored
        dir.mark(&PeerId::from_public_key("nobody"), PeerStatus::Connected)
            .unwrap();
    }

    #[test]
    fn test_directory_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        let peer_id = {
            let records = Records::new(Arc::new(Storage::new(&db_path).unwrap()));
            let mut dir = PeerDirectory::new(10, records);
            dir.add_peer(PeerDescriptor::new("Love", "love-key"))
                .unwrap()
                .peer_id
        };

        {
            let records = Records::new(Arc::new(Storage::new(&db_path).unwrap()));
            let dir = PeerDirectory::load(10, records).unwrap();
            assert_eq!(dir.get(&peer_id).unwrap().name, "Love");
        }
    }
}
