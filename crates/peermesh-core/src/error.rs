//! Error types for the peer-network core

use thiserror::Error;

use crate::types::PeerId;

/// Main error type for peer-network operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// The directory already holds the configured maximum number of peers
    #[error("Peer limit exceeded: {max} peers already known")]
    PeerLimitExceeded { max: usize },

    /// The supervisor already tracks the configured maximum number of connections
    #[error("Connection limit exceeded: {max} connections already active")]
    ConnectionLimitExceeded { max: usize },

    /// Inbound message is not a `{ "type": string, "data": any }` object
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Inbound payload is larger than `maxMessageSize`
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// Peer is not present in the directory
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Offer/answer exchange with a peer did not complete
    #[error("Connection establishment with {peer_id} failed: {reason}")]
    ConnectionEstablishmentFailed { peer_id: PeerId, reason: String },

    /// A peer could not be reached during a sync pass
    #[error("Sync peer {peer_id} unreachable: {reason}")]
    SyncPeerUnreachable { peer_id: PeerId, reason: String },

    /// Signaling transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// LAN discovery failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;
