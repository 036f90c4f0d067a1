//! Connection records keyed by peer, with write-through persistence

use std::collections::HashMap;

use tracing::warn;

use crate::error::MeshResult;
use crate::storage::Records;
use crate::types::{Connection, ConnectionEvent, ConnectionStatus, PeerId};

/// At most one connection per peer
pub struct ConnectionTable {
    connections: HashMap<PeerId, Connection>,
    records: Records,
}

impl ConnectionTable {
    pub fn new(records: Records) -> Self {
        Self {
            connections: HashMap::new(),
            records,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Connection> {
        self.connections.get(peer_id)
    }

    /// Insert (or replace) a record and persist it
    pub fn insert(&mut self, connection: Connection) -> MeshResult<()> {
        self.records.save_connection(&connection)?;
        self.connections
            .insert(connection.peer_id.clone(), connection);
        Ok(())
    }

    /// Feed an event to a peer's state machine and persist the result.
    ///
    /// Returns the new status, or `None` if there is no record or the
    /// transition is not allowed.
    pub fn apply(
        &mut self,
        peer_id: &PeerId,
        event: ConnectionEvent,
    ) -> MeshResult<Option<ConnectionStatus>> {
        let Some(connection) = self.connections.get_mut(peer_id) else {
            return Ok(None);
        };
        let from = connection.status;
        match connection.apply(event) {
            Some(next) => {
                self.records.save_connection(connection)?;
                Ok(Some(next))
            }
            None => {
                warn!(peer_id = %peer_id.short(), %from, ?event, "Rejected connection transition");
                Ok(None)
            }
        }
    }

    /// Mutate a record in place and persist it
    pub fn update<F>(&mut self, peer_id: &PeerId, f: F) -> MeshResult<bool>
    where
        F: FnOnce(&mut Connection),
    {
        let Some(connection) = self.connections.get_mut(peer_id) else {
            return Ok(false);
        };
        f(connection);
        self.records.save_connection(connection)?;
        Ok(true)
    }

    /// Drop a record from memory and storage
    pub fn remove(&mut self, peer_id: &PeerId) -> MeshResult<Option<Connection>> {
        self.records.delete_connection(peer_id)?;
        Ok(self.connections.remove(peer_id))
    }

    /// Connections that still count against `maxConnections`
    pub fn active_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.status.is_active())
            .count()
    }

    /// Peers whose link is `connected`
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .values()
            .filter(|c| c.status.is_connected())
            .map(|c| c.peer_id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
