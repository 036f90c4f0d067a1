//! In-memory record store

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{RecordStore, Table};
use crate::error::MeshError;

/// Record store backed by ordered in-memory maps.
///
/// Nothing survives the process; used by tests and by nodes started without a
/// data directory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }
}

impl RecordStore for MemoryStore {
    fn upsert(&self, table: Table, key: &str, value: &[u8]) -> Result<(), MeshError> {
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: Table, key: &str) -> Result<(), MeshError> {
        if let Some(records) = self.tables.write().get_mut(&table) {
            records.remove(key);
        }
        Ok(())
    }

    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|records| records.get(key).cloned()))
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, MeshError> {
        let tables = self.tables.read();
        let Some(records) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete_prefix(&self, table: Table, prefix: &str) -> Result<usize, MeshError> {
        let mut tables = self.tables.write();
        let Some(records) = tables.get_mut(&table) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|key, _| !key.starts_with(prefix));
        Ok(before - records.len())
    }
}
