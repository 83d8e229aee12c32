//! Error types for the node module.

use cxo_core::{CoreError, Hash, PublicKey};
use cxo_store::StoreError;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed or badly signed Root.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u16, peer: u16 },

    /// The peer refused the handshake.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    /// The send queue of a connection overflowed; the connection is closed.
    #[error("send queue full")]
    SendQueueFull,

    #[error("peer is not a public server")]
    NotPublic,

    #[error("no such feed: {0}")]
    NoSuchFeed(PublicKey),

    /// The peer does not share the feed.
    #[error("subscription to {0} rejected")]
    SubscriptionRejected(PublicKey),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An object of a Root graph is neither stored nor provided.
    #[error("missing object: {0}")]
    MissingObject(Hash),

    /// The keypair does not own the feed.
    #[error("not the owner of feed {0}")]
    NotFeedOwner(PublicKey),

    /// A fill was dropped in favour of a newer Root.
    #[error("fill of seq {seq} superseded by seq {by}")]
    Superseded { seq: u64, by: u64 },

    /// A fill was dropped because retention removed its seq.
    #[error("fill of seq {0} pruned")]
    Pruned(u64),

    /// The node (or one of its actors) has shut down.
    #[error("node is closed")]
    Closed,

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Transport(e.to_string())
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
