//! # CXO Testkit
//!
//! Testing utilities for CXO.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: feed owners, object graphs and recording hooks
//! - **Harness**: a hand-driven peer for scripting replication scenarios
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust
//! use cxo_testkit::fixtures::{ObjectSet, TestFeed};
//!
//! let feed = TestFeed::with_seed([1; 32]);
//! let mut objects = ObjectSet::new();
//! let leaf = objects.leaf("hello");
//! let root = feed.first(&[objects.node(&[leaf], "dir")]);
//! assert!(root.verify().is_ok());
//! ```
//!
//! ## Scripted Peers
//!
//! ```rust,ignore
//! use cxo_testkit::harness::PeerHarness;
//!
//! let mut peer = PeerHarness::connect(&network, "node").await?;
//! peer.subscribe(feed.public_key()).await?;
//! peer.announce(&root).await?;
//! peer.serve(objects.as_map(), 2).await?;
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cxo_testkit::generators::{Graph, GraphParams};
//!
//! proptest! {
//!     #[test]
//!     fn counts_cover_reachable(params: GraphParams) {
//!         let graph = Graph::from_params(&params);
//!         prop_assert_eq!(graph.expected_refcounts().len(), graph.reachable().len());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod harness;

pub use fixtures::{eventually, init_tracing, multi_feed_fixtures, ObjectSet, RecordingHooks, TestFeed};
pub use harness::PeerHarness;
