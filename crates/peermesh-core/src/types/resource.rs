//! Resource snapshots

use serde::{Deserialize, Serialize};

use super::now_millis;

/// Point-in-time resource snapshot, local or reported by a peer.
///
/// Append-only. Memory and storage are bytes; `cpu` is global usage in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu: f32,
    #[serde(default)]
    pub load_average: f64,
    pub memory_used: u64,
    pub memory_free: u64,
    #[serde(default)]
    pub memory_total: u64,
    pub storage_used: u64,
    #[serde(default)]
    pub uptime_secs: u64,
    /// Unix millis when the sample was taken
    pub updated: i64,
}

impl ResourceSample {
    /// An all-zero sample stamped now
    pub fn empty() -> Self {
        Self {
            cpu: 0.0,
            load_average: 0.0,
            memory_used: 0,
            memory_free: 0,
            memory_total: 0,
            storage_used: 0,
            uptime_secs: 0,
            updated: now_millis(),
        }
    }
}
