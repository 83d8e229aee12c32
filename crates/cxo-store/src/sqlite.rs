//! SQLite implementation of the ContentStore trait.
//!
//! This is the persistent backend. It uses rusqlite with bundled SQLite
//! behind a mutex; every call is short and synchronous.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cxo_core::Hash;
use rusqlite::{params, Connection, OptionalExtension};

use crate::cxds::{
    apply_delta, check_set, decode_entry, encode_entry, ContentStore, ObjectStat, Sweep,
};
use crate::error::{Result, StoreError};
use crate::migration;

/// Entries fetched per lock acquisition while iterating.
const PAGE: i64 = 128;

/// SQLite-based ContentStore.
///
/// Thread-safe via internal Mutex.
pub struct SqliteCxds {
    conn: Arc<Mutex<Connection>>,
    closed: AtomicBool,
}

impl SqliteCxds {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_conn(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
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

    /// Execute a blocking operation on the connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let conn = self.conn.lock().map_err(poisoned)?;
        f(&conn)
    }

    /// Execute a blocking operation that needs mutable access.
    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut conn = self.conn.lock().map_err(poisoned)?;
        f(&mut conn)
    }
}

pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
        Some(format!("mutex poisoned: {}", e)),
    ))
}

fn load(conn: &Connection, key: &Hash) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT entry FROM objects WHERE key = ?1",
            params![&key.0[..]],
            |row| row.get(0),
        )
        .optional()?)
}

fn save(conn: &Connection, key: &Hash, rc: u32, value: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO objects (key, entry) VALUES (?1, ?2)",
        params![&key.0[..], encode_entry(rc, value)],
    )?;
    Ok(())
}

fn remove(conn: &Connection, key: &Hash) -> Result<()> {
    conn.execute("DELETE FROM objects WHERE key = ?1", params![&key.0[..]])?;
    Ok(())
}

/// Up to `PAGE` entries with key strictly greater than `cursor`.
fn page(conn: &Connection, cursor: &[u8]) -> Result<Vec<(Hash, Vec<u8>)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT key, entry FROM objects WHERE key > ?1 ORDER BY key LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![cursor, PAGE], |row| {
        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (key, entry) = row?;
        let key = Hash::try_from(key.as_slice())
            .map_err(|_| StoreError::InvalidData(format!("key of {} bytes", key.len())))?;
        out.push((key, entry));
    }
    Ok(out)
}

impl ContentStore for SqliteCxds {
    fn get(&self, key: &Hash, delta: i64) -> Result<(Bytes, u32)> {
        if delta == 0 {
            return self.with_conn(|conn| {
                let entry = load(conn, key)?.ok_or(StoreError::NotFound(*key))?;
                let (rc, value) = decode_entry(&entry)?;
                Ok((Bytes::copy_from_slice(value), rc))
            });
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let entry = load(&tx, key)?.ok_or(StoreError::NotFound(*key))?;
            let (rc, value) = decode_entry(&entry)?;
            let rc = apply_delta(rc, delta);
            save(&tx, key, rc, value)?;
            tx.commit()?;
            Ok((Bytes::copy_from_slice(value), rc))
        })
    }

    fn set(&self, key: &Hash, value: &[u8], delta: u32) -> Result<u32> {
        check_set(delta, value)?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let rc = match load(&tx, key)? {
                Some(entry) => {
                    let (rc, existing) = decode_entry(&entry)?;
                    let rc = rc.saturating_add(delta);
                    save(&tx, key, rc, existing)?;
                    rc
                }
                None => {
                    save(&tx, key, delta, value)?;
                    delta
                }
            };
            tx.commit()?;
            Ok(rc)
        })
    }

    fn inc(&self, key: &Hash, delta: i64) -> Result<u32> {
        self.get(key, delta).map(|(_, rc)| rc)
    }

    fn dec(&self, key: &Hash) -> Result<(Bytes, u32)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let entry = load(&tx, key)?.ok_or(StoreError::NotFound(*key))?;
            let (rc, value) = decode_entry(&entry)?;
            if rc == 0 {
                return Err(StoreError::RefcountUnderflow(*key));
            }
            save(&tx, key, rc - 1, value)?;
            tx.commit()?;
            Ok((Bytes::copy_from_slice(value), rc - 1))
        })
    }

    fn del(&self, key: &Hash) -> Result<()> {
        self.with_conn(|conn| remove(conn, key))
    }

    fn iterate(
        &self,
        f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<ControlFlow<()>>,
    ) -> Result<()> {
        let mut cursor: Vec<u8> = Vec::new();
        loop {
            // The lock is released before the callback runs.
            let rows = self.with_conn(|conn| page(conn, &cursor))?;
            if rows.is_empty() {
                return Ok(());
            }
            for (key, entry) in &rows {
                let (rc, value) = decode_entry(entry)?;
                if f(key, rc, value)?.is_break() {
                    return Ok(());
                }
                cursor = key.0.to_vec();
            }
        }
    }

    fn iterate_del(&self, f: &mut dyn FnMut(&Hash, u32, &[u8]) -> Result<Sweep>) -> Result<()> {
        let mut cursor: Vec<u8> = Vec::new();
        loop {
            let done = self.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                let rows = page(&tx, &cursor)?;
                if rows.is_empty() {
                    return Ok(true);
                }
                let mut stop = false;
                for (key, entry) in &rows {
                    let (rc, value) = decode_entry(entry)?;
                    match f(key, rc, value)? {
                        Sweep::Keep => {}
                        Sweep::Delete => remove(&tx, key)?,
                        Sweep::Stop => {
                            stop = true;
                            break;
                        }
                    }
                    cursor = key.0.to_vec();
                }
                tx.commit()?;
                Ok(stop)
            })?;
            if done {
                return Ok(());
            }
        }
    }

    fn multi_inc(&self, keys: &[Hash]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                entries.push(load(&tx, key)?.ok_or(StoreError::NotFound(*key))?);
            }
            let mut counts: BTreeMap<Hash, (u32, Vec<u8>)> = BTreeMap::new();
            for (key, entry) in keys.iter().zip(entries) {
                let (rc, value) = decode_entry(&entry)?;
                let slot = counts.entry(*key).or_insert_with(|| (rc, value.to_vec()));
                slot.0 = slot.0.saturating_add(1);
            }
            for (key, (rc, value)) in &counts {
                save(&tx, key, *rc, value)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn multi_dec(&self, keys: &[Hash]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut counts: BTreeMap<Hash, (u32, Vec<u8>)> = BTreeMap::new();
            for key in keys {
                if !counts.contains_key(key) {
                    let entry = load(&tx, key)?.ok_or(StoreError::NotFound(*key))?;
                    let (rc, value) = decode_entry(&entry)?;
                    counts.insert(*key, (rc, value.to_vec()));
                }
                if let Some(slot) = counts.get_mut(key) {
                    if slot.0 == 0 {
                        return Err(StoreError::RefcountUnderflow(*key));
                    }
                    slot.0 -= 1;
                }
            }
            for (key, (rc, value)) in &counts {
                save(&tx, key, *rc, value)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn stat(&self) -> Result<ObjectStat> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT substr(entry, 1, 4), length(entry) FROM objects")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut stat = ObjectStat::default();
            for row in rows {
                let (head, len) = row?;
                let (rc, _) = decode_entry(&head)?;
                stat.add(rc, (len as usize).saturating_sub(4));
            }
            Ok(stat)
        })
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Flush pending statements; the connection itself closes on drop.
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.flush_prepared_statement_cache();
        Ok(())
    }
}
