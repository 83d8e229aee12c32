//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use cxo_core::{encode_object, encode_root_payload, DagObject, Hash, Keypair, PublicKey, Root, RootBuilder};
use cxo_node::{Connection, Hooks, NodeError};

/// A feed owner and the head it writes to.
pub struct TestFeed {
    pub keypair: Keypair,
    pub nonce: u64,
}

impl TestFeed {
    /// Create a new test feed with a random keypair.
    pub fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            nonce: 0,
        }
    }

    /// Create with a deterministic keypair from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            keypair: Keypair::from_seed(&seed),
            nonce: 0,
        }
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Sign the first Root of the head over `refs`.
    pub fn first(&self, refs: &[Hash]) -> Root {
        RootBuilder::new(self.public_key())
            .nonce(self.nonce)
            .payload(encode_root_payload(refs))
            .sign(&self.keypair)
    }

    /// Sign the Root following `prev` over `refs`.
    pub fn next(&self, prev: &Root, refs: &[Hash]) -> Root {
        RootBuilder::after(prev)
            .payload(encode_root_payload(refs))
            .sign(&self.keypair)
    }
}

impl Default for TestFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple feeds with distinct deterministic keys.
pub fn multi_feed_fixtures(count: usize) -> Vec<TestFeed> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8;
            seed[1] = 0xfe;
            TestFeed::with_seed(seed)
        })
        .collect()
}

/// Builds object graphs of the default schema and keeps the encoded values.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    values: HashMap<Hash, Bytes>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leaf object.
    pub fn leaf(&mut self, data: &str) -> Hash {
        self.insert(DagObject::leaf(data.to_string()))
    }

    /// Add an object referencing `refs`.
    pub fn node(&mut self, refs: &[Hash], data: &str) -> Hash {
        self.insert(DagObject::node(refs.to_vec(), data.to_string()))
    }

    fn insert(&mut self, obj: DagObject) -> Hash {
        let value = Bytes::from(encode_object(&obj));
        let hash = Hash::sum(&value);
        self.values.insert(hash, value);
        hash
    }

    pub fn get(&self, hash: &Hash) -> Option<&Bytes> {
        self.values.get(hash)
    }

    /// Encoded values of the given objects, as `Node::publish` takes them.
    pub fn values_of(&self, hashes: &[Hash]) -> Vec<Bytes> {
        hashes.iter().filter_map(|h| self.values.get(h).cloned()).collect()
    }

    /// Every encoded value.
    pub fn values(&self) -> Vec<Bytes> {
        self.values.values().cloned().collect()
    }

    pub fn as_map(&self) -> &HashMap<Hash, Bytes> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Hooks that record what they observe.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    events: Mutex<Events>,
}

/// Snapshot of what [`RecordingHooks`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Events {
    /// `(seq, hash)` of every Root received.
    pub received: Vec<(u64, Hash)>,
    /// Seqs of filled Roots.
    pub filled: Vec<u64>,
    /// Seq and error text of broken fills.
    pub breaks: Vec<(u64, String)>,
    pub connects: usize,
    pub disconnects: usize,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Events {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, f: impl FnOnce(&mut Events)) {
        match self.events.lock() {
            Ok(mut events) => f(&mut events),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Hooks for RecordingHooks {
    fn on_root_received(&self, _conn: &Connection, root: &Root) {
        self.record(|e| e.received.push((root.seq, root.hash)));
    }

    fn on_root_filled(&self, root: &Root) {
        self.record(|e| e.filled.push(root.seq));
    }

    fn on_filling_breaks(&self, root: &Root, err: &NodeError) {
        self.record(|e| e.breaks.push((root.seq, err.to_string())));
    }

    fn on_connect(&self, _conn: &Connection) {
        self.record(|e| e.connects += 1);
    }

    fn on_disconnect(&self, _conn: &Connection) {
        self.record(|e| e.disconnects += 1);
    }
}

/// Poll `f` until it holds; panics after about five seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Send debug logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
