//! ContentStore: refcounted blob storage keyed by content hash.
//!
//! Every entry is `(hash, refcount, value)`. An entry whose refcount drops to
//! zero stays physically present, and readable, until a sweep removes it.

use std::ops::ControlFlow;

use bytes::Bytes;
use cxo_core::Hash;

use crate::error::{Result, StoreError};
use crate::volume::Volume;

/// What [`ContentStore::iterate_del`] should do with the visited entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Keep,
    Delete,
    /// End the scan, keeping the entry.
    Stop,
}

/// Object statistics of a ContentStore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectStat {
    /// All entries, including those with rc == 0.
    pub amount: u64,
    pub volume: Volume,
    /// Entries with rc > 0.
    pub used_amount: u64,
    pub used_volume: Volume,
}

impl ObjectStat {
    /// Account one entry.
    pub fn add(&mut self, rc: u32, len: usize) {
        self.amount += 1;
        self.volume.0 += len as u64;
        if rc > 0 {
            self.used_amount += 1;
            self.used_volume.0 += len as u64;
        }
    }
}

/// The ContentStore trait.
///
/// Calls are synchronous and internally locked; they are safe to make from
/// any task. Every mutation of a key is linearizable with every other
/// mutation of the same key.
pub trait ContentStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Single Key
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a value and its refcount, applying `delta` to the refcount in the
    /// same step. The returned refcount is the one after the change.
    ///
    /// Negative deltas clamp at zero.
    fn get(&self, key: &Hash, delta: i64) -> Result<(Bytes, u32)>;

    /// Create the entry with `rc = delta`, or add `delta` to an existing one.
    /// Returns the new refcount.
    ///
    /// # Panics
    ///
    /// If `delta` is zero. `set` pins, it never creates an unreferenced entry.
    fn set(&self, key: &Hash, value: &[u8], delta: u32) -> Result<u32>;

    /// Store `value` under its own hash with one reference.
    fn add(&self, value: &[u8]) -> Result<(Hash, u32)> {
        let key = Hash::sum(value);
        let rc = self.set(&key, value, 1)?;
        Ok((key, rc))
    }

    /// Change the refcount without touching the value. A zero `delta` is an
    /// existence probe. Negative deltas clamp at zero.
    fn inc(&self, key: &Hash, delta: i64) -> Result<u32>;

    /// Drop one reference, returning the value and the refcount after the
    /// change in the same step. Fails with `RefcountUnderflow` at rc 0.
    fn dec(&self, key: &Hash) -> Result<(Bytes, u32)>;

    /// Delete the entry regardless of its refcount. Absent keys are fine.
    fn del(&self, key: &Hash) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Iteration
    // ─────────────────────────────────────────────────────────────────────────

    /// Visit every entry once, in key order.
    ///
    /// `Break` ends the scan cleanly, an `Err` aborts it and is returned.
    /// The callback may use the store.
    fn iterate(
        &self,
        f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<ControlFlow<()>>,
    ) -> Result<()>;

    /// Like [`ContentStore::iterate`], deleting the entries the callback
    /// marks. No entry is skipped or repeated because of a deletion.
    ///
    /// The callback runs under the store lock and must not use the store.
    fn iterate_del(&self, f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<Sweep>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Batches
    // ─────────────────────────────────────────────────────────────────────────

    /// Read several values. Fails with `NotFound` if any is missing.
    fn multi_get(&self, keys: &[Hash]) -> Result<Vec<Bytes>> {
        keys.iter().map(|k| self.get(k, 0).map(|(v, _)| v)).collect()
    }

    /// Store several values, one reference each.
    fn multi_add(&self, values: &[Bytes]) -> Result<Vec<Hash>> {
        values.iter().map(|v| self.add(v).map(|(k, _)| k)).collect()
    }

    /// Add one reference to every key. Nothing changes if any key is missing.
    fn multi_inc(&self, keys: &[Hash]) -> Result<()>;

    /// Drop one reference from every key. Nothing changes if any key is
    /// missing or already at rc 0.
    fn multi_dec(&self, keys: &[Hash]) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Physically remove every entry with rc == 0. Returns how many.
    fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        self.iterate_del(&mut |_, rc, _| {
            if rc == 0 {
                removed += 1;
                Ok(Sweep::Delete)
            } else {
                Ok(Sweep::Keep)
            }
        })?;
        Ok(removed)
    }

    fn stat(&self) -> Result<ObjectStat>;

    /// Close the store. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;
}

/// Apply a signed delta to a refcount, clamping into `0..=u32::MAX`.
pub fn apply_delta(rc: u32, delta: i64) -> u32 {
    (rc as i64).saturating_add(delta).clamp(0, u32::MAX as i64) as u32
}

pub(crate) fn check_set(delta: u32, value: &[u8]) -> Result<()> {
    assert!(delta > 0, "ContentStore::set with zero delta");
    if value.is_empty() {
        return Err(StoreError::EmptyValue);
    }
    Ok(())
}

/// Encode a persisted entry: `rc` as u32 little-endian followed by the value.
pub fn encode_entry(rc: u32, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.extend_from_slice(&rc.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decode a persisted entry into its refcount and value.
pub fn decode_entry(entry: &[u8]) -> Result<(u32, &[u8])> {
    if entry.len() < 4 {
        return Err(StoreError::InvalidData(format!(
            "entry of {} bytes",
            entry.len()
        )));
    }
    let (rc, value) = entry.split_at(4);
    let rc = u32::from_le_bytes([rc[0], rc[1], rc[2], rc[3]]);
    Ok((rc, value))
}
