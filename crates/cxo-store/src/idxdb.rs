//! MetaIndex: feeds, heads and Root descriptors.
//!
//! The index never holds object bytes. A Root descriptor ([`RootMeta`])
//! names the Root by hash; the encoded Root lives in the ContentStore.
//!
//! All access goes through [`IdxDb::tx`]. The views handed to the closure
//! borrow the open transaction: everything they change commits together
//! when the closure returns `Ok`, and rolls back when it returns `Err`.
//!
//! Iteration re-seeks after every visited entry, so callbacks may add or
//! remove entries of the collection being iterated.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cxo_core::{now_nanos, Hash, PublicKey, Root, Signature};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::sqlite::poisoned;

/// Descriptor of a stored Root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMeta {
    pub seq: u64,
    pub prev: Hash,
    pub hash: Hash,
    pub sig: Signature,
    /// Set when the descriptor is first stored, nanoseconds.
    pub create_time: u64,
    /// Refreshed on every `set`, nanoseconds.
    pub access_time: u64,
    /// Whether every object reachable from the Root is local.
    pub is_full: bool,
}

impl RootMeta {
    /// A not-yet-full descriptor of `root`.
    pub fn new(root: &Root) -> Self {
        Self {
            seq: root.seq,
            prev: root.prev,
            hash: root.hash,
            sig: root.sig,
            create_time: 0,
            access_time: 0,
            is_full: false,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(160);
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

fn be(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn from_be(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("u64 of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// The SQLite-backed MetaIndex.
pub struct IdxDb {
    conn: Arc<Mutex<Connection>>,
    closed: AtomicBool,
}

impl IdxDb {
    /// Open (or create) the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_conn(conn))
    }

    /// Open an in-memory index.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_conn(conn))
    }

    fn from_conn(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `f` in a transaction.
    pub fn tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Feeds<'_>) -> Result<T>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        // An early return drops `tx`, which rolls back.
        let out = f(Feeds { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Close the index. Later transactions fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// The set of feeds.
#[derive(Clone, Copy)]
pub struct Feeds<'a> {
    conn: &'a Connection,
}

impl<'a> Feeds<'a> {
    /// Add a feed. Adding an existing feed does nothing.
    pub fn add(&self, feed: &PublicKey) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO feeds (feed) VALUES (?1)",
            params![&feed.0[..]],
        )?;
        Ok(())
    }

    /// Remove a feed and its (empty) heads.
    ///
    /// Fails with `FeedNotEmpty` if any head still has a Root. Removing an
    /// absent feed does nothing.
    pub fn del(&self, feed: &PublicKey) -> Result<()> {
        if !self.has(feed)? {
            return Ok(());
        }
        let has_roots: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM roots WHERE feed = ?1)",
            params![&feed.0[..]],
            |row| row.get(0),
        )?;
        if has_roots {
            return Err(StoreError::FeedNotEmpty(*feed));
        }
        self.conn
            .execute("DELETE FROM heads WHERE feed = ?1", params![&feed.0[..]])?;
        self.conn
            .execute("DELETE FROM feeds WHERE feed = ?1", params![&feed.0[..]])?;
        Ok(())
    }

    pub fn has(&self, feed: &PublicKey) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM feeds WHERE feed = ?1)",
            params![&feed.0[..]],
            |row| row.get(0),
        )?)
    }

    /// Visit feeds in key order.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&PublicKey) -> Result<ControlFlow<()>>,
    {
        let mut cursor: Vec<u8> = Vec::new();
        loop {
            let next: Option<Vec<u8>> = self
                .conn
                .query_row(
                    "SELECT feed FROM feeds WHERE feed > ?1 ORDER BY feed LIMIT 1",
                    params![cursor],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = next else {
                return Ok(());
            };
            let feed = PublicKey::try_from(raw.as_slice())
                .map_err(|_| StoreError::InvalidData(format!("feed of {} bytes", raw.len())))?;
            if f(&feed)?.is_break() {
                return Ok(());
            }
            cursor = raw;
        }
    }

    /// All feeds, in key order.
    pub fn list(&self) -> Result<Vec<PublicKey>> {
        let mut feeds = Vec::new();
        self.iterate(|pk| {
            feeds.push(*pk);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(feeds)
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM feeds", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Heads of a feed.
    pub fn heads(&self, feed: &PublicKey) -> Result<Heads<'a>> {
        if !self.has(feed)? {
            return Err(StoreError::NoSuchFeed(*feed));
        }
        Ok(Heads {
            conn: self.conn,
            feed: *feed,
        })
    }
}

/// The heads of one feed.
#[derive(Clone, Copy)]
pub struct Heads<'a> {
    conn: &'a Connection,
    feed: PublicKey,
}

impl<'a> Heads<'a> {
    pub fn feed(&self) -> PublicKey {
        self.feed
    }

    /// Add a head (if absent) and return its Roots.
    pub fn add(&self, nonce: u64) -> Result<Roots<'a>> {
        self.conn.execute(
            "INSERT OR IGNORE INTO heads (feed, nonce) VALUES (?1, ?2)",
            params![&self.feed.0[..], &be(nonce)[..]],
        )?;
        Ok(self.view(nonce))
    }

    /// Remove a head together with its Root descriptors.
    pub fn del(&self, nonce: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM roots WHERE feed = ?1 AND nonce = ?2",
            params![&self.feed.0[..], &be(nonce)[..]],
        )?;
        self.conn.execute(
            "DELETE FROM heads WHERE feed = ?1 AND nonce = ?2",
            params![&self.feed.0[..], &be(nonce)[..]],
        )?;
        Ok(())
    }

    pub fn has(&self, nonce: u64) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM heads WHERE feed = ?1 AND nonce = ?2)",
            params![&self.feed.0[..], &be(nonce)[..]],
            |row| row.get(0),
        )?)
    }

    /// Visit nonces in ascending order.
    pub fn iterate<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64) -> Result<ControlFlow<()>>,
    {
        let mut from = 0u64;
        loop {
            let next: Option<Vec<u8>> = self
                .conn
                .query_row(
                    "SELECT nonce FROM heads WHERE feed = ?1 AND nonce >= ?2
                     ORDER BY nonce LIMIT 1",
                    params![&self.feed.0[..], &be(from)[..]],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = next else {
                return Ok(());
            };
            let nonce = from_be(&raw)?;
            if f(nonce)?.is_break() {
                return Ok(());
            }
            match nonce.checked_add(1) {
                Some(n) => from = n,
                None => return Ok(()),
            }
        }
    }

    /// All nonces, ascending.
    pub fn list(&self) -> Result<Vec<u64>> {
        let mut nonces = Vec::new();
        self.iterate(|n| {
            nonces.push(n);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(nonces)
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM heads WHERE feed = ?1",
            params![&self.feed.0[..]],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Roots of an existing head.
    pub fn roots(&self, nonce: u64) -> Result<Roots<'a>> {
        if !self.has(nonce)? {
            return Err(StoreError::NoSuchHead {
                feed: self.feed,
                nonce,
            });
        }
        Ok(self.view(nonce))
    }

    fn view(&self, nonce: u64) -> Roots<'a> {
        Roots {
            conn: self.conn,
            feed: self.feed,
            nonce,
        }
    }
}

/// The Root descriptors of one head, ordered by seq.
#[derive(Clone, Copy)]
pub struct Roots<'a> {
    conn: &'a Connection,
    feed: PublicKey,
    nonce: u64,
}

impl<'a> Roots<'a> {
    pub fn feed(&self) -> PublicKey {
        self.feed
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Insert or touch a descriptor.
    ///
    /// A new descriptor must extend the chain: seq 0 needs a zero `prev`,
    /// any other seq needs seq - 1 stored with hash `prev`. An existing
    /// descriptor must carry the same hash and signature; only `is_full` and
    /// `access_time` change. The stored timestamps are written back to `meta`.
    pub fn set(&self, meta: &mut RootMeta) -> Result<()> {
        self.put(meta, true)
    }

    /// Like [`Roots::set`], but a missing predecessor is allowed, making
    /// `meta` the base of the locally known chain. A present predecessor is
    /// still checked.
    pub fn set_base(&self, meta: &mut RootMeta) -> Result<()> {
        self.put(meta, false)
    }

    fn put(&self, meta: &mut RootMeta, strict: bool) -> Result<()> {
        if (meta.seq == 0) != meta.prev.is_zero() {
            return Err(StoreError::BrokenChain {
                seq: meta.seq,
                reason: "prev must be zero exactly for seq 0".into(),
            });
        }

        let now = now_nanos();

        if let Some(mut existing) = self.load(meta.seq)? {
            if existing.hash != meta.hash || existing.sig != meta.sig {
                return Err(StoreError::RootConflict {
                    seq: meta.seq,
                    existing: existing.hash,
                });
            }
            existing.access_time = now;
            existing.is_full = meta.is_full;
            self.store(&existing)?;

            meta.create_time = existing.create_time;
            meta.access_time = existing.access_time;
            return Ok(());
        }

        if meta.seq > 0 {
            match self.load(meta.seq - 1)? {
                Some(prev) if prev.hash != meta.prev => {
                    return Err(StoreError::BrokenChain {
                        seq: meta.seq,
                        reason: format!("prev {} does not match stored {}", meta.prev, prev.hash),
                    });
                }
                Some(_) => {}
                None if strict => {
                    return Err(StoreError::BrokenChain {
                        seq: meta.seq,
                        reason: format!("missing seq {}", meta.seq - 1),
                    });
                }
                None => {}
            }
        }

        meta.create_time = now;
        meta.access_time = now;
        self.store(meta)
    }

    pub fn get(&self, seq: u64) -> Result<RootMeta> {
        self.load(seq)?.ok_or(StoreError::NoSuchRoot(seq))
    }

    pub fn has(&self, seq: u64) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq = ?3)",
            params![&self.feed.0[..], &be(self.nonce)[..], &be(seq)[..]],
            |row| row.get(0),
        )?)
    }

    /// Delete a descriptor. Absent seqs are fine.
    pub fn del(&self, seq: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq = ?3",
            params![&self.feed.0[..], &be(self.nonce)[..], &be(seq)[..]],
        )?;
        Ok(())
    }

    /// Delete every descriptor with seq strictly below `seq`, returning them
    /// in ascending order.
    pub fn del_before(&self, seq: u64) -> Result<Vec<RootMeta>> {
        let mut removed = Vec::new();
        self.ascend(|meta| {
            if meta.seq >= seq {
                return Ok(ControlFlow::Break(()));
            }
            removed.push(meta.clone());
            Ok(ControlFlow::Continue(()))
        })?;

        self.conn.execute(
            "DELETE FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq < ?3",
            params![&self.feed.0[..], &be(self.nonce)[..], &be(seq)[..]],
        )?;
        Ok(removed)
    }

    /// Visit descriptors from the lowest seq up.
    pub fn ascend<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&RootMeta) -> Result<ControlFlow<()>>,
    {
        let mut from = 0u64;
        loop {
            let Some(meta) = self.seek(
                "SELECT meta FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq >= ?3
                 ORDER BY seq ASC LIMIT 1",
                from,
            )?
            else {
                return Ok(());
            };
            if f(&meta)?.is_break() {
                return Ok(());
            }
            match meta.seq.checked_add(1) {
                Some(n) => from = n,
                None => return Ok(()),
            }
        }
    }

    /// Visit descriptors from the highest seq down.
    pub fn descend<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&RootMeta) -> Result<ControlFlow<()>>,
    {
        let mut from = u64::MAX;
        loop {
            let Some(meta) = self.seek(
                "SELECT meta FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq <= ?3
                 ORDER BY seq DESC LIMIT 1",
                from,
            )?
            else {
                return Ok(());
            };
            if f(&meta)?.is_break() {
                return Ok(());
            }
            match meta.seq.checked_sub(1) {
                Some(n) => from = n,
                None => return Ok(()),
            }
        }
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM roots WHERE feed = ?1 AND nonce = ?2",
            params![&self.feed.0[..], &be(self.nonce)[..]],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The descriptor with the highest seq.
    pub fn last(&self) -> Result<Option<RootMeta>> {
        self.seek(
            "SELECT meta FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq <= ?3
             ORDER BY seq DESC LIMIT 1",
            u64::MAX,
        )
    }

    /// The full descriptor with the highest seq.
    pub fn last_full(&self) -> Result<Option<RootMeta>> {
        let mut found = None;
        self.descend(|meta| {
            if meta.is_full {
                found = Some(meta.clone());
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    fn seek(&self, sql: &str, seq: u64) -> Result<Option<RootMeta>> {
        let raw: Option<Vec<u8>> = self
            .conn
            .prepare_cached(sql)?
            .query_row(
                params![&self.feed.0[..], &be(self.nonce)[..], &be(seq)[..]],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|b| RootMeta::decode(&b)).transpose()
    }

    fn load(&self, seq: u64) -> Result<Option<RootMeta>> {
        let raw: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT meta FROM roots WHERE feed = ?1 AND nonce = ?2 AND seq = ?3",
                params![&self.feed.0[..], &be(self.nonce)[..], &be(seq)[..]],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|b| RootMeta::decode(&b)).transpose()
    }

    fn store(&self, meta: &RootMeta) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO roots (feed, nonce, seq, meta) VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.feed.0[..],
                &be(self.nonce)[..],
                &be(meta.seq)[..],
                meta.encode()?
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxo_core::{Keypair, RootBuilder};

    /// A chain of `n` Roots on head `nonce` of a fixed feed.
    fn chain(kp: &Keypair, nonce: u64, n: usize) -> Vec<Root> {
        let mut roots: Vec<Root> = Vec::new();
        for i in 0..n {
            let root = match roots.last() {
                None => RootBuilder::new(kp.public_key()).nonce(nonce),
                Some(prev) => RootBuilder::after(prev),
            }
            .time(i as u64)
            .payload(vec![i as u8])
            .sign(kp);
            roots.push(root);
        }
        roots
    }

    #[test]
    fn test_feeds_add_has_del() {
        let idx = IdxDb::open_memory().unwrap();
        let a = Keypair::from_seed(&[1; 32]).public_key();
        let b = Keypair::from_seed(&[2; 32]).public_key();

        idx.tx(|feeds| {
            feeds.add(&a)?;
            feeds.add(&a)?;
            feeds.add(&b)?;
            assert_eq!(feeds.len()?, 2);
            assert!(feeds.has(&a)?);
            feeds.del(&a)?;
            feeds.del(&a)?;
            assert!(!feeds.has(&a)?);
            assert_eq!(feeds.list()?, vec![b]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_feed_not_empty() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[3; 32]);
        let pk = kp.public_key();
        let roots = chain(&kp, 0, 1);

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            feeds.heads(&pk)?.add(0)?.set(&mut RootMeta::new(&roots[0]))?;
            Ok(())
        })
        .unwrap();

        let err = idx.tx(|feeds| feeds.del(&pk)).unwrap_err();
        assert!(matches!(err, StoreError::FeedNotEmpty(_)));

        // An empty head does not block deletion
        idx.tx(|feeds| {
            let heads = feeds.heads(&pk)?;
            heads.roots(0)?.del(0)?;
            heads.add(7)?;
            feeds.del(&pk)?;
            assert!(!feeds.has(&pk)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let idx = IdxDb::open_memory().unwrap();
        let pk = Keypair::from_seed(&[4; 32]).public_key();

        let res: Result<()> = idx.tx(|feeds| {
            feeds.add(&pk)?;
            Err(StoreError::InvalidData("abort".into()))
        });
        assert!(res.is_err());
        assert!(!idx.tx(|feeds| feeds.has(&pk)).unwrap());
    }

    #[test]
    fn test_missing_feed_and_head() {
        let idx = IdxDb::open_memory().unwrap();
        let pk = Keypair::from_seed(&[5; 32]).public_key();

        assert!(matches!(
            idx.tx(|feeds| feeds.heads(&pk).map(|_| ())),
            Err(StoreError::NoSuchFeed(_))
        ));

        idx.tx(|feeds| feeds.add(&pk)).unwrap();
        assert!(matches!(
            idx.tx(|feeds| feeds.heads(&pk)?.roots(1).map(|_| ())),
            Err(StoreError::NoSuchHead { nonce: 1, .. })
        ));
    }

    #[test]
    fn test_heads_list_and_iterate() {
        let idx = IdxDb::open_memory().unwrap();
        let pk = Keypair::from_seed(&[6; 32]).public_key();

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            let heads = feeds.heads(&pk)?;
            for nonce in [300u64, 2, u64::MAX, 0] {
                heads.add(nonce)?;
            }
            assert_eq!(heads.list()?, vec![0, 2, 300, u64::MAX]);
            assert_eq!(heads.len()?, 4);

            // delete while iterating
            heads.iterate(|nonce| {
                if nonce == 2 {
                    heads.del(300)?;
                }
                Ok(ControlFlow::Continue(()))
            })?;
            assert_eq!(heads.list()?, vec![0, 2, u64::MAX]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_root_chain_invariant() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[7; 32]);
        let pk = kp.public_key();
        let roots = chain(&kp, 0, 3);

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            feeds.heads(&pk)?.add(0)?;
            Ok(())
        })
        .unwrap();

        // seq 1 without seq 0
        let err = idx
            .tx(|feeds| feeds.heads(&pk)?.roots(0)?.set(&mut RootMeta::new(&roots[1])))
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokenChain { seq: 1, .. }));

        // seq 0 with non-zero prev
        let mut bad = RootMeta::new(&roots[0]);
        bad.prev = Hash::sum(b"nope");
        let err = idx
            .tx(|feeds| feeds.heads(&pk)?.roots(0)?.set(&mut bad))
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokenChain { seq: 0, .. }));

        // proper chain
        idx.tx(|feeds| {
            let rs = feeds.heads(&pk)?.roots(0)?;
            for r in &roots {
                rs.set(&mut RootMeta::new(r))?;
            }
            assert_eq!(rs.len()?, 3);
            Ok(())
        })
        .unwrap();

        // a different Root at an existing seq
        let other = RootBuilder::after(&roots[0]).time(99).sign(&kp);
        let err = idx
            .tx(|feeds| feeds.heads(&pk)?.roots(0)?.set(&mut RootMeta::new(&other)))
            .unwrap_err();
        assert!(matches!(err, StoreError::RootConflict { seq: 1, .. }));
    }

    #[test]
    fn test_set_base_allows_gap_but_checks_link() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[8; 32]);
        let pk = kp.public_key();
        let roots = chain(&kp, 0, 5);

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            let rs = feeds.heads(&pk)?.add(0)?;
            rs.set_base(&mut RootMeta::new(&roots[3]))?;
            rs.set(&mut RootMeta::new(&roots[4]))?;

            // a predecessor that does not link
            let mut wrong = RootMeta::new(&roots[4]);
            wrong.seq = 5;
            wrong.prev = roots[2].hash;
            wrong.hash = Hash::sum(b"wrong");
            assert!(matches!(
                rs.set_base(&mut wrong),
                Err(StoreError::BrokenChain { seq: 5, .. })
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_set_updates_bookkeeping_only() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[9; 32]);
        let pk = kp.public_key();
        let root = &chain(&kp, 0, 1)[0];

        let first = idx
            .tx(|feeds| {
                feeds.add(&pk)?;
                let rs = feeds.heads(&pk)?.add(0)?;
                let mut meta = RootMeta::new(root);
                rs.set(&mut meta)?;
                Ok(meta)
            })
            .unwrap();
        assert!(first.create_time > 0);
        assert!(!first.is_full);

        let stored = idx
            .tx(|feeds| {
                let rs = feeds.heads(&pk)?.roots(0)?;
                let mut meta = RootMeta::new(root);
                meta.is_full = true;
                rs.set(&mut meta)?;
                assert_eq!(meta.create_time, first.create_time);
                rs.get(0)
            })
            .unwrap();
        assert!(stored.is_full);
        assert_eq!(stored.create_time, first.create_time);
        assert!(stored.access_time >= first.access_time);
        assert_eq!(stored.hash, root.hash);
    }

    #[test]
    fn test_roots_ascend_descend_del_before() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[10; 32]);
        let pk = kp.public_key();
        let roots = chain(&kp, 3, 6);

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            let rs = feeds.heads(&pk)?.add(3)?;
            for r in &roots {
                let mut meta = RootMeta::new(r);
                meta.is_full = r.seq < 4;
                rs.set(&mut meta)?;
            }

            let mut up = Vec::new();
            rs.ascend(|m| {
                up.push(m.seq);
                Ok(ControlFlow::Continue(()))
            })?;
            assert_eq!(up, vec![0, 1, 2, 3, 4, 5]);

            let mut down = Vec::new();
            rs.descend(|m| {
                down.push(m.seq);
                Ok(if m.seq == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })?;
            assert_eq!(down, vec![5, 4, 3]);

            assert_eq!(rs.last()?.map(|m| m.seq), Some(5));
            assert_eq!(rs.last_full()?.map(|m| m.seq), Some(3));

            let removed = rs.del_before(2)?;
            assert_eq!(removed.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![0, 1]);
            assert!(!rs.has(1)?);
            assert!(rs.has(2)?);
            assert_eq!(rs.len()?, 4);
            assert!(matches!(rs.get(0), Err(StoreError::NoSuchRoot(0))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_ascend_with_deletion_visits_each_once() {
        let idx = IdxDb::open_memory().unwrap();
        let kp = Keypair::from_seed(&[11; 32]);
        let pk = kp.public_key();
        let roots = chain(&kp, 0, 9);

        idx.tx(|feeds| {
            feeds.add(&pk)?;
            let rs = feeds.heads(&pk)?.add(0)?;
            for r in &roots {
                rs.set(&mut RootMeta::new(r))?;
            }

            let mut seen = Vec::new();
            rs.ascend(|m| {
                seen.push(m.seq);
                if m.seq % 3 == 0 {
                    rs.del(m.seq)?;
                }
                Ok(ControlFlow::Continue(()))
            })?;
            assert_eq!(seen, (0..9).collect::<Vec<_>>());
            assert_eq!(rs.len()?, 6);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_idxdb_persists_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.db");
        let pk = Keypair::from_seed(&[12; 32]).public_key();

        {
            let idx = IdxDb::open(&path).unwrap();
            idx.tx(|feeds| feeds.add(&pk)).unwrap();
            idx.close().unwrap();
            assert!(matches!(idx.tx(|feeds| feeds.len()), Err(StoreError::Closed)));
        }

        let idx = IdxDb::open(&path).unwrap();
        assert!(idx.tx(|feeds| feeds.has(&pk)).unwrap());
    }
}
