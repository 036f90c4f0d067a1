//! Persistence collaborator.
//!
//! The core writes through the narrow [`RecordStore`] interface: upsert,
//! delete and lookups over a handful of named tables. Two implementations ship:
//! - [`Storage`]: ACID persistence in a single redb file
//! - [`MemoryStore`]: process-local maps for tests and ephemeral nodes
//!
//! Typed access (peers, connections, resource samples, sync state) lives in
//! [`Records`].

use crate::error::MeshError;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

mod memory;
mod records;

pub use memory::MemoryStore;
pub use records::{Records, LOCAL_SAMPLE_KEY};

// Table definitions
const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");
const CONNECTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("connections");
const RESOURCES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");
const SYNC_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_state");

/// Record tables the core reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Peers,
    Connections,
    Resources,
    SyncState,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Peers,
        Table::Connections,
        Table::Resources,
        Table::SyncState,
    ];

    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Peers => PEERS_TABLE,
            Table::Connections => CONNECTIONS_TABLE,
            Table::Resources => RESOURCES_TABLE,
            Table::SyncState => SYNC_STATE_TABLE,
        }
    }
}

/// Key/record store supplied by the surrounding application
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite a record
    fn upsert(&self, table: Table, key: &str, value: &[u8]) -> Result<(), MeshError>;

    /// Remove a record; no error if it does not exist
    fn delete(&self, table: Table, key: &str) -> Result<(), MeshError>;

    /// Look up one record by key
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, MeshError>;

    /// All records whose key starts with `prefix`, in key order
    fn scan_prefix(&self, table: Table, prefix: &str)
        -> Result<Vec<(String, Vec<u8>)>, MeshError>;

    /// Remove every record whose key starts with `prefix`; returns how many
    fn delete_prefix(&self, table: Table, prefix: &str) -> Result<usize, MeshError>;
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let _ = write_txn.open_table(table.definition())?;
            }
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl RecordStore for Storage {
    fn upsert(&self, table: Table, key: &str, value: &[u8]) -> Result<(), MeshError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut t = write_txn.open_table(table.definition())?;
            t.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, table: Table, key: &str) -> Result<(), MeshError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut t = write_txn.open_table(table.definition())?;
            t.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;

        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let t = read_txn.open_table(table.definition())?;

        let mut records = Vec::new();
        for entry in t.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            records.push((key.to_string(), value.value().to_vec()));
        }
        Ok(records)
    }

    fn delete_prefix(&self, table: Table, prefix: &str) -> Result<usize, MeshError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed;
        {
            let mut t = write_txn.open_table(table.definition())?;

            let mut keys = Vec::new();
            for entry in t.range(prefix..)? {
                let (key, _) = entry?;
                let key = key.value();
                if !key.starts_with(prefix) {
                    break;
                }
                keys.push(key.to_string());
            }

            for key in &keys {
                t.remove(key.as_str())?;
            }
            removed = keys.len();
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
