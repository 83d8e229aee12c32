//! Error types for the store module.

use cxo_core::{Hash, PublicKey};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object has never been stored (or was swept).
    #[error("object not found: {0}")]
    NotFound(Hash),

    #[error("no such feed: {0}")]
    NoSuchFeed(PublicKey),

    #[error("no such head: feed {feed}, nonce {nonce}")]
    NoSuchHead { feed: PublicKey, nonce: u64 },

    #[error("no such root: seq {0}")]
    NoSuchRoot(u64),

    /// A feed can only be removed once all its heads are empty.
    #[error("feed {0} is not empty")]
    FeedNotEmpty(PublicKey),

    /// A different Root is already stored at this seq.
    #[error("conflict at seq {seq}: existing root {existing}")]
    RootConflict { seq: u64, existing: Hash },

    /// The Root does not link to its stored predecessor.
    #[error("broken chain at seq {seq}: {reason}")]
    BrokenChain { seq: u64, reason: String },

    #[error("refcount underflow: {0}")]
    RefcountUnderflow(Hash),

    #[error("empty value")]
    EmptyValue,

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    #[error("store is closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this is one of the "absent" errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::NoSuchFeed(_)
                | StoreError::NoSuchHead { .. }
                | StoreError::NoSuchRoot(_)
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
