//! # CXO Store
//!
//! Persistence for CXO: a refcounted content-addressed object store
//! (the ContentStore, or CXDS) and the feed/head/Root metadata index
//! (the MetaIndex, or IdxDB).
//!
//! ## Key Types
//!
//! - [`ContentStore`] - refcounted blob storage keyed by [`cxo_core::Hash`]
//! - [`SqliteCxds`] - SQLite-based persistent ContentStore
//! - [`MemoryCxds`] - in-memory ContentStore for tests
//! - [`IdxDb`] - transactional feed/head/Root index with [`Feeds`], [`Heads`]
//!   and [`Roots`] views
//! - [`RootMeta`] - the stored descriptor of a Root
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cxo_store::{ContentStore, IdxDb, SqliteCxds};
//!
//! let cxds = SqliteCxds::open("cxds.db").unwrap();
//! let (_key, rc) = cxds.add(b"object").unwrap();
//! assert_eq!(rc, 1);
//!
//! let idx = IdxDb::open("idx.db").unwrap();
//! let feeds = idx.tx(|feeds| feeds.list()).unwrap();
//! ```
//!
//! ## Design Notes
//!
//! - **Lazy deletion**: an entry whose refcount reaches zero stays readable
//!   until [`ContentStore::sweep`] removes it
//! - **Strict chains**: [`Roots::set`] only accepts a Root linking to its
//!   stored predecessor
//! - **One schema**: both stores migrate the same schema, so they may share
//!   a database file

pub mod cxds;
pub mod error;
pub mod idxdb;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod volume;

pub use cxds::{apply_delta, ContentStore, ObjectStat, Sweep};
pub use error::{Result, StoreError};
pub use idxdb::{Feeds, Heads, IdxDb, RootMeta, Roots};
pub use memory::MemoryCxds;
pub use sqlite::SqliteCxds;
pub use volume::Volume;
