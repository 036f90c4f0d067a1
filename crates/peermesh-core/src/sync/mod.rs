//! Offline synchronization
//!
//! Local mutations are queued in [`SyncState::pending_changes`] and drained by
//! [`SyncEngine::sync_with_peers`] over whatever links are up. How two
//! version vectors are compared is a [`VectorStrategy`]; how changes travel is
//! a [`SyncPeer`]. Both are supplied by the application.

mod engine;
mod state;
mod strategy;

pub use engine::{SyncEngine, SyncPeer, SyncPeerProvider, SyncReport};
pub use state::{SyncState, VersionVector};
pub use strategy::{CounterStrategy, VectorDiff, VectorStrategy};
