//! # CXO Node
//!
//! Replication of feeds between peers.
//!
//! ## Overview
//!
//! A [`Node`] shares feeds. Peers subscribe to each other's feeds and push
//! every Root they hold in full. A node receiving a newer Root *fills* it:
//! it walks the Root's object graph breadth-first, requesting the objects
//! it lacks from the peers that advertised the Root, and pins every object
//! it reaches in the content store. Once the graph is complete the Root is
//! marked full and announced onward.
//!
//! ## Actors
//!
//! - one actor per connection owns the link, the pending-request table and
//!   the keepalive
//! - the registry owns feeds, subscriptions and the head actors
//! - one actor per head `(feed, nonce)` fills at most one Root at a time,
//!   publishes local Roots and applies retention
//!
//! ## Transport
//!
//! Any [`Transport`] that moves frames works. [`TcpTransport`] frames over
//! TCP; [`MemoryNetwork`] wires nodes together in-process for tests.

mod codec;
mod connection;
mod filler;
mod head;
mod registry;

pub mod config;
pub mod error;
pub mod hooks;
pub mod messages;
pub mod node;
pub mod transport;

pub use codec::{decode as decode_frame, encode as encode_frame, MAX_FRAME};
pub use config::NodeConfig;
pub use connection::{ConnId, ConnState, Connection};
pub use error::{NodeError, Result};
pub use head::HeadStatus;
pub use hooks::{Hooks, NoHooks};
pub use messages::{Envelope, Msg, PROTOCOL_VERSION};
pub use node::{FeedStat, HeadStat, Node, NodeBuilder, NodeStat};
pub use transport::memory::MemoryNetwork;
pub use transport::tcp::TcpTransport;
pub use transport::{link_pair, Link, Listener, Transport, LINK_CAPACITY};
