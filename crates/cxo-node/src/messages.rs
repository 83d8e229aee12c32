//! Wire message types.
//!
//! Every frame carries one [`Envelope`]: a random id, the id of the request
//! it answers (if any), and a [`Msg`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cxo_core::{Hash, PublicKey, Root};

/// Current protocol version, exchanged in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    /// Keepalive.
    Ping,
    Pong,

    /// Handshake: sent by the dialer.
    Hello { version: u16, node_id: PublicKey },
    /// Handshake accepted: sent by the acceptor.
    Accept { node_id: PublicKey },
    /// Handshake refused; the connection closes.
    Reject { reason: String },

    /// Start exchanging Roots of a feed. Answered with `AcceptSubscription`
    /// if the receiver shares the feed, `RejectSubscription` otherwise.
    Subscribe { feed: PublicKey },
    AcceptSubscription { feed: PublicKey },
    RejectSubscription { feed: PublicKey },
    Unsubscribe { feed: PublicKey },

    /// Announcement of a Root the sender holds in full.
    Root(Root),

    /// Ask for an object by hash.
    RequestObject { hash: Hash },
    Object { value: Bytes },
    NotFound { hash: Hash },

    /// Ask a public node for the feeds it shares.
    RequestListOfFeeds,
    ListOfFeeds { feeds: Vec<PublicKey> },
    NonPublicServer,
}

impl Msg {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Msg::Ping => "ping",
            Msg::Pong => "pong",
            Msg::Hello { .. } => "hello",
            Msg::Accept { .. } => "accept",
            Msg::Reject { .. } => "reject",
            Msg::Subscribe { .. } => "subscribe",
            Msg::AcceptSubscription { .. } => "accept_subscription",
            Msg::RejectSubscription { .. } => "reject_subscription",
            Msg::Unsubscribe { .. } => "unsubscribe",
            Msg::Root(_) => "root",
            Msg::RequestObject { .. } => "request_object",
            Msg::Object { .. } => "object",
            Msg::NotFound { .. } => "not_found",
            Msg::RequestListOfFeeds => "request_list_of_feeds",
            Msg::ListOfFeeds { .. } => "list_of_feeds",
            Msg::NonPublicServer => "non_public_server",
        }
    }

    /// Whether this message answers a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Msg::Accept { .. }
                | Msg::Reject { .. }
                | Msg::AcceptSubscription { .. }
                | Msg::RejectSubscription { .. }
                | Msg::Object { .. }
                | Msg::NotFound { .. }
                | Msg::ListOfFeeds { .. }
                | Msg::NonPublicServer
        )
    }
}

/// A framed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub reply_to: Option<u64>,
    pub msg: Msg,
}

impl Envelope {
    /// A message with a fresh random id.
    pub fn new(msg: Msg) -> Self {
        Self {
            id: rand::random(),
            reply_to: None,
            msg,
        }
    }

    /// A response to the request with id `to`.
    pub fn reply(to: u64, msg: Msg) -> Self {
        Self {
            id: rand::random(),
            reply_to: Some(to),
            msg,
        }
    }
}
