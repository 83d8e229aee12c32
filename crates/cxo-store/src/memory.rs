//! In-memory ContentStore, mirroring [`crate::SqliteCxds`] semantics.
//!
//! Useful for tests and for nodes that do not need persistence.

use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use cxo_core::Hash;

use crate::cxds::{apply_delta, check_set, ContentStore, ObjectStat, Sweep};
use crate::error::{Result, StoreError};

/// Entries fetched per lock acquisition while iterating.
const PAGE: usize = 128;

#[derive(Debug, Clone)]
struct Entry {
    rc: u32,
    value: Bytes,
}

/// In-memory ContentStore.
#[derive(Debug, Default)]
pub struct MemoryCxds {
    inner: RwLock<BTreeMap<Hash, Entry>>,
    closed: AtomicBool,
}

impl MemoryCxds {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Hash, Entry>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.inner
            .read()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Hash, Entry>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.inner
            .write()
            .map_err(|e| StoreError::InvalidData(format!("lock poisoned: {}", e)))
    }

    /// Up to `PAGE` entries strictly after `cursor`.
    fn page(map: &BTreeMap<Hash, Entry>, cursor: Option<Hash>) -> Vec<(Hash, Entry)> {
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        map.range((lower, Bound::Unbounded))
            .take(PAGE)
            .map(|(k, e)| (*k, e.clone()))
            .collect()
    }
}

impl ContentStore for MemoryCxds {
    fn get(&self, key: &Hash, delta: i64) -> Result<(Bytes, u32)> {
        if delta == 0 {
            let map = self.read()?;
            let entry = map.get(key).ok_or(StoreError::NotFound(*key))?;
            return Ok((entry.value.clone(), entry.rc));
        }

        let mut map = self.write()?;
        let entry = map.get_mut(key).ok_or(StoreError::NotFound(*key))?;
        entry.rc = apply_delta(entry.rc, delta);
        Ok((entry.value.clone(), entry.rc))
    }

    fn set(&self, key: &Hash, value: &[u8], delta: u32) -> Result<u32> {
        check_set(delta, value)?;

        let mut map = self.write()?;
        let entry = map.entry(*key).or_insert_with(|| Entry {
            rc: 0,
            value: Bytes::copy_from_slice(value),
        });
        entry.rc = entry.rc.saturating_add(delta);
        Ok(entry.rc)
    }

    fn inc(&self, key: &Hash, delta: i64) -> Result<u32> {
        self.get(key, delta).map(|(_, rc)| rc)
    }

    fn dec(&self, key: &Hash) -> Result<(Bytes, u32)> {
        let mut map = self.write()?;
        let entry = map.get_mut(key).ok_or(StoreError::NotFound(*key))?;
        if entry.rc == 0 {
            return Err(StoreError::RefcountUnderflow(*key));
        }
        entry.rc -= 1;
        Ok((entry.value.clone(), entry.rc))
    }

    fn del(&self, key: &Hash) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    fn iterate(
        &self,
        f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut cursor = None;
        loop {
            // The lock is released before the callback runs.
            let page = Self::page(&*self.read()?, cursor);
            if page.is_empty() {
                return Ok(());
            }
            for (key, entry) in &page {
                if f(key, entry.rc, &entry.value)?.is_break() {
                    return Ok(());
                }
                cursor = Some(*key);
            }
        }
    }

    fn iterate_del(&self, f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<Sweep>) -> Result<()> {
        let mut cursor = None;
        loop {
            let mut map = self.write()?;
            let page = Self::page(&map, cursor);
            if page.is_empty() {
                return Ok(());
            }
            for (key, entry) in &page {
                match f(key, entry.rc, &entry.value)? {
                    Sweep::Keep => {}
                    Sweep::Delete => {
                        map.remove(key);
                    }
                    Sweep::Stop => return Ok(()),
                }
                cursor = Some(*key);
            }
        }
    }

    fn multi_inc(&self, keys: &[Hash]) -> Result<()> {
        let mut map = self.write()?;
        if let Some(missing) = keys.iter().find(|k| !map.contains_key(*k)) {
            return Err(StoreError::NotFound(*missing));
        }
        for key in keys {
            if let Some(entry) = map.get_mut(key) {
                entry.rc = entry.rc.saturating_add(1);
            }
        }
        Ok(())
    }

    fn multi_dec(&self, keys: &[Hash]) -> Result<()> {
        let mut map = self.write()?;

        // Validate against the counts the batch itself would leave behind.
        let mut pending: BTreeMap<Hash, u32> = BTreeMap::new();
        for key in keys {
            let entry = map.get(key).ok_or(StoreError::NotFound(*key))?;
            let taken = pending.entry(*key).or_insert(0);
            if entry.rc <= *taken {
                return Err(StoreError::RefcountUnderflow(*key));
            }
            *taken += 1;
        }

        for (key, n) in pending {
            if let Some(entry) = map.get_mut(&key) {
                entry.rc -= n;
            }
        }
        Ok(())
    }

    fn stat(&self) -> Result<ObjectStat> {
        let map = self.read()?;
        let mut stat = ObjectStat::default();
        for entry in map.values() {
            stat.add(entry.rc, entry.value.len());
        }
        Ok(stat)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
