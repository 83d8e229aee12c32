//! # CXO
//!
//! Signed feeds of content-addressed object graphs, replicated between
//! peers.
//!
//! ## Overview
//!
//! - A **feed** is a public key. Its owner publishes **Roots**: signed,
//!   chained snapshots, each pointing at a graph of immutable objects.
//! - A feed may carry several independent chains, one per **head**
//!   `(feed, nonce)`.
//! - Objects live in a refcounted content store. A Root held in full pins
//!   every object it reaches, once per reference; dropping the Root releases
//!   them again.
//! - Nodes subscribe to each other's feeds. A newer Root from a peer is
//!   *filled*: its missing objects are fetched from the peers that announced
//!   it, then the Root is announced onward.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cxo::{encode_root_payload, Keypair, MemoryNetwork, Node};
//!
//! # async fn example() -> cxo::node::Result<()> {
//! let net = MemoryNetwork::new();
//! let publisher = Node::builder().transport(Arc::new(net.clone())).spawn().await?;
//! let addr = publisher.listen("publisher").await?;
//!
//! let owner = Keypair::generate();
//! publisher.publish(&owner, 0, encode_root_payload(&[]), vec![]).await?;
//!
//! let reader = Node::builder().transport(Arc::new(net)).spawn().await?;
//! let conn = reader.connect(&addr).await?;
//! reader.subscribe(&conn, owner.public_key()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! - `cxo::core` - hashes, keys, Roots and the schema walker
//! - `cxo::store` - the content store and the Root index
//! - `cxo::node` - connections and replication

pub use cxo_core as core;
pub use cxo_node as node;
pub use cxo_store as store;

pub use cxo_core::{
    encode_object, encode_root_payload, CborSchema, DagObject, Hash, Keypair, PublicKey, Root,
    RootBuilder, Signature, Walker,
};
pub use cxo_node::{
    Connection, Hooks, MemoryNetwork, Node, NodeBuilder, NodeConfig, NodeError, TcpTransport,
};
pub use cxo_store::{ContentStore, IdxDb, MemoryCxds, RootMeta, SqliteCxds};
