//! # CXO Core
//!
//! Pure primitives for CXO: content hashes, feed keys, signed Root snapshots
//! and the schema seam used to discover references between objects.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Hash`] - SHA-256 content address of an object
//! - [`PublicKey`] - identity of a feed (and of a node)
//! - [`Root`] - signed, versioned snapshot of an object graph
//! - [`Walker`] - discovers the hashes an encoded Root or object references
//!
//! ## Roots
//!
//! A Root belongs to a head `(feed, nonce)` and is chained to its predecessor
//! through `prev`. The feed owner signs the Root hash; everything else about
//! a Root is read-only once signed.

pub mod crypto;
pub mod error;
pub mod root;
pub mod schema;

pub use crypto::{Hash, Keypair, PublicKey, Signature};
pub use error::{CoreError, Result};
pub use root::{now_nanos, Root, RootBuilder, ROOT_VERSION};
pub use schema::{decode_object, encode_object, encode_root_payload, CborSchema, DagObject, Walker};
