//! Root: the signed, versioned snapshot of a feed's object graph.
//!
//! A Root is encoded as a deterministic CBOR map with small integer keys:
//!
//! | key | field   |
//! |-----|---------|
//! | 0   | version |
//! | 1   | feed    |
//! | 2   | nonce   |
//! | 3   | seq     |
//! | 4   | prev    |
//! | 5   | time    |
//! | 6   | payload |
//!
//! The encoded bytes are what the ContentStore keeps, so `hash` is both the
//! content address of the Root blob and the message the feed owner signs.

use bytes::Bytes;
use ciborium::value::{Integer, Value};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{Hash, Keypair, PublicKey, Signature};
use crate::error::{CoreError, Result};

/// Current Root encoding version.
pub const ROOT_VERSION: u64 = 1;

mod keys {
    pub const VERSION: u64 = 0;
    pub const FEED: u64 = 1;
    pub const NONCE: u64 = 2;
    pub const SEQ: u64 = 3;
    pub const PREV: u64 = 4;
    pub const TIME: u64 = 5;
    pub const PAYLOAD: u64 = 6;
}

/// Current time as nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A signed snapshot of a head `(feed, nonce)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub feed: PublicKey,
    pub nonce: u64,
    pub seq: u64,
    /// Hash of the previous Root of the head, `Hash::ZERO` for seq 0.
    pub prev: Hash,
    /// Creation time set by the feed owner, nanoseconds.
    pub time: u64,
    /// Opaque to the core; interpreted by a [`crate::Walker`].
    pub payload: Bytes,
    pub hash: Hash,
    pub sig: Signature,
}

impl Root {
    /// Canonical bytes of this Root, as stored in the ContentStore.
    pub fn encode(&self) -> Vec<u8> {
        encode_parts(
            &self.feed,
            self.nonce,
            self.seq,
            &self.prev,
            self.time,
            &self.payload,
        )
    }

    /// Rebuild a Root from its stored bytes and the signature kept alongside.
    ///
    /// The hash is recomputed from `bytes`; the signature is not verified.
    pub fn decode(bytes: &[u8], sig: Signature) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::Decoding(format!("root: {e}")))?;

        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(CoreError::MalformedRoot("expected a map".into())),
        };

        let mut version = None;
        let mut feed = None;
        let mut nonce = None;
        let mut seq = None;
        let mut prev = None;
        let mut time = None;
        let mut payload = None;

        for (k, v) in entries {
            let key = match k {
                Value::Integer(i) => u64::try_from(i)
                    .map_err(|_| CoreError::MalformedRoot("negative key".into()))?,
                _ => return Err(CoreError::MalformedRoot("non-integer key".into())),
            };
            match key {
                keys::VERSION => version = Some(as_u64(v, "version")?),
                keys::FEED => feed = Some(PublicKey(as_array(v, "feed")?)),
                keys::NONCE => nonce = Some(as_u64(v, "nonce")?),
                keys::SEQ => seq = Some(as_u64(v, "seq")?),
                keys::PREV => prev = Some(Hash(as_array(v, "prev")?)),
                keys::TIME => time = Some(as_u64(v, "time")?),
                keys::PAYLOAD => payload = Some(as_bytes(v, "payload")?),
                other => {
                    return Err(CoreError::MalformedRoot(format!("unknown key {other}")));
                }
            }
        }

        let version = version.ok_or_else(|| missing("version"))?;
        if version != ROOT_VERSION {
            return Err(CoreError::MalformedRoot(format!(
                "unsupported version {version}"
            )));
        }

        Ok(Root {
            feed: feed.ok_or_else(|| missing("feed"))?,
            nonce: nonce.ok_or_else(|| missing("nonce"))?,
            seq: seq.ok_or_else(|| missing("seq"))?,
            prev: prev.ok_or_else(|| missing("prev"))?,
            time: time.ok_or_else(|| missing("time"))?,
            payload: Bytes::from(payload.ok_or_else(|| missing("payload"))?),
            hash: Hash::sum(bytes),
            sig,
        })
    }

    /// Recompute the hash from the fields.
    pub fn compute_hash(&self) -> Hash {
        Hash::sum(&self.encode())
    }

    /// Check the structural rule, the hash and the feed signature.
    pub fn verify(&self) -> Result<()> {
        if (self.seq == 0) != self.prev.is_zero() {
            return Err(CoreError::MalformedRoot(format!(
                "seq {} with prev {}",
                self.seq, self.prev
            )));
        }

        let actual = self.compute_hash();
        if actual != self.hash {
            return Err(CoreError::HashMismatch {
                expected: self.hash,
                actual,
            });
        }

        self.feed.verify(self.hash.as_bytes(), &self.sig)
    }

    /// Whether this is the first Root of its head.
    pub fn is_first(&self) -> bool {
        self.seq == 0
    }
}

/// Builder for signed Roots.
#[derive(Debug)]
pub struct RootBuilder {
    feed: PublicKey,
    nonce: u64,
    seq: u64,
    prev: Hash,
    time: Option<u64>,
    payload: Bytes,
}

impl RootBuilder {
    /// Start building a Root of `feed`. Defaults to nonce 0, seq 0.
    pub fn new(feed: PublicKey) -> Self {
        Self {
            feed,
            nonce: 0,
            seq: 0,
            prev: Hash::ZERO,
            time: None,
            payload: Bytes::new(),
        }
    }

    /// Start building the Root that follows `prev` on the same head.
    pub fn after(prev: &Root) -> Self {
        Self::new(prev.feed)
            .nonce(prev.nonce)
            .seq(prev.seq + 1)
            .prev(prev.hash)
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn prev(mut self, prev: Hash) -> Self {
        self.prev = prev;
        self
    }

    /// Set the creation time. Defaults to now.
    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn payload(mut self, p: impl Into<Bytes>) -> Self {
        self.payload = p.into();
        self
    }

    /// Build and sign the Root.
    ///
    /// The keypair is expected to own the feed; a mismatch produces a Root
    /// that fails [`Root::verify`].
    pub fn sign(self, keypair: &Keypair) -> Root {
        let time = self.time.unwrap_or_else(now_nanos);
        let encoded = encode_parts(
            &self.feed,
            self.nonce,
            self.seq,
            &self.prev,
            time,
            &self.payload,
        );
        let hash = Hash::sum(&encoded);
        let sig = keypair.sign(hash.as_bytes());

        Root {
            feed: self.feed,
            nonce: self.nonce,
            seq: self.seq,
            prev: self.prev,
            time,
            payload: self.payload,
            hash,
            sig,
        }
    }
}

fn encode_parts(
    feed: &PublicKey,
    nonce: u64,
    seq: u64,
    prev: &Hash,
    time: u64,
    payload: &[u8],
) -> Vec<u8> {
    // Entries in key order, integers in their smallest form (ciborium default).
    let entries = vec![
        (int(keys::VERSION), int(ROOT_VERSION)),
        (int(keys::FEED), Value::Bytes(feed.0.to_vec())),
        (int(keys::NONCE), int(nonce)),
        (int(keys::SEQ), int(seq)),
        (int(keys::PREV), Value::Bytes(prev.0.to_vec())),
        (int(keys::TIME), int(time)),
        (int(keys::PAYLOAD), Value::Bytes(payload.to_vec())),
    ];

    let mut buf = Vec::with_capacity(128 + payload.len());
    // Writing into a Vec cannot fail.
    let _ = ciborium::into_writer(&Value::Map(entries), &mut buf);
    buf
}

fn int(v: u64) -> Value {
    Value::Integer(Integer::from(v))
}

fn missing(field: &str) -> CoreError {
    CoreError::MalformedRoot(format!("missing {field}"))
}

fn as_u64(v: Value, field: &str) -> Result<u64> {
    match v {
        Value::Integer(i) => {
            u64::try_from(i).map_err(|_| CoreError::MalformedRoot(format!("bad {field}")))
        }
        _ => Err(CoreError::MalformedRoot(format!("{field} is not an integer"))),
    }
}

fn as_bytes(v: Value, field: &str) -> Result<Vec<u8>> {
    match v {
        Value::Bytes(b) => Ok(b),
        _ => Err(CoreError::MalformedRoot(format!("{field} is not bytes"))),
    }
}

fn as_array(v: Value, field: &str) -> Result<[u8; 32]> {
    let b = as_bytes(v, field)?;
    b.as_slice()
        .try_into()
        .map_err(|_| CoreError::MalformedRoot(format!("{field} has length {}", b.len())))
}
