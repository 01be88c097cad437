//! A pure in-memory [`KvBackend`] reference implementation.
//!
//! This is the one backend this crate ships: a template for real adapters
//! and the backing store for the entire test suite. It is intentionally
//! simple — an `Arc<Mutex<BTreeMap<...>>>` per table — rather than
//! performance-tuned; a broad compatibility adapter layer over many KV
//! backends is left to downstream integrators.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::backend::{Cursor, KvBackend, KvTable};
use crate::error::Result;

#[derive(Default)]
struct TableData {
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
    high_water: u64,
}

/// A handle to one table's shared in-memory storage.
#[derive(Clone)]
pub struct MemoryTable {
    data: Arc<Mutex<TableData>>,
}

impl KvTable for MemoryTable {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.lock().unwrap().rows.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().rows.get(key).cloned())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.lock().unwrap().rows.remove(key);
        Ok(())
    }

    fn cursor(&self) -> Box<dyn Cursor> {
        Box::new(MemoryCursor { data: self.data.clone(), pos: None, miss_at: None })
    }

    fn append(&mut self, value: &[u8]) -> Result<u64> {
        let mut guard = self.data.lock().unwrap();
        let key = guard.high_water;
        guard.high_water += 1;
        guard.rows.insert(key.to_be_bytes().to_vec(), value.to_vec());
        Ok(key)
    }

    fn high_water(&self) -> u64 {
        self.data.lock().unwrap().high_water
    }

    fn set_high_water(&mut self, value: u64) {
        self.data.lock().unwrap().high_water = value;
    }
}

/// A cursor over a table's shared, live `Arc<Mutex<TableData>>`: it holds no
/// snapshot of its own, so a write made through this handle or any other
/// handle to the same table — before or after the cursor was created — is
/// visible on the very next `next`/`prev`/`seek` call, matching the sharing
/// contract `KvBackend::open_table` documents.
struct MemoryCursor {
    data: Arc<Mutex<TableData>>,
    /// Key of the row the cursor currently sits on, if any. Re-resolved
    /// against the live map on every call rather than cached by index.
    pos: Option<Vec<u8>>,
    /// Set by a `seek_exact` miss to the key that was probed for; consumed
    /// (and cleared) by the next `next`/`prev` call so that call lands on
    /// the nearest real row in the requested direction.
    miss_at: Option<Vec<u8>>,
}

impl Cursor for MemoryCursor {
    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.miss_at = None;
        let guard = self.data.lock().unwrap();
        match guard.rows.iter().next() {
            Some((k, v)) => {
                let row = (k.clone(), v.clone());
                self.pos = Some(k.clone());
                Ok(Some(row))
            }
            None => {
                self.pos = None;
                Ok(None)
            }
        }
    }

    fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.miss_at = None;
        let guard = self.data.lock().unwrap();
        match guard.rows.iter().next_back() {
            Some((k, v)) => {
                let row = (k.clone(), v.clone());
                self.pos = Some(k.clone());
                Ok(Some(row))
            }
            None => {
                self.pos = None;
                Ok(None)
            }
        }
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let guard = self.data.lock().unwrap();
        let found = if let Some(miss_key) = self.miss_at.take() {
            guard.rows.range((Bound::Included(miss_key), Bound::Unbounded)).next()
        } else if let Some(pos_key) = &self.pos {
            guard.rows.range((Bound::Excluded(pos_key.clone()), Bound::Unbounded)).next()
        } else {
            guard.rows.iter().next()
        };
        match found {
            Some((k, v)) => {
                let row = (k.clone(), v.clone());
                self.pos = Some(k.clone());
                Ok(Some(row))
            }
            None => {
                self.pos = None;
                Ok(None)
            }
        }
    }

    fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let guard = self.data.lock().unwrap();
        let found = if let Some(miss_key) = self.miss_at.take() {
            guard.rows.range((Bound::Unbounded, Bound::Excluded(miss_key))).next_back()
        } else if let Some(pos_key) = &self.pos {
            guard.rows.range((Bound::Unbounded, Bound::Excluded(pos_key.clone()))).next_back()
        } else {
            guard.rows.iter().next_back()
        };
        match found {
            Some((k, v)) => {
                let row = (k.clone(), v.clone());
                self.pos = Some(k.clone());
                Ok(Some(row))
            }
            None => {
                self.pos = None;
                Ok(None)
            }
        }
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.miss_at = None;
        let guard = self.data.lock().unwrap();
        match guard.rows.range((Bound::Included(key.to_vec()), Bound::Unbounded)).next() {
            Some((k, v)) => {
                let row = (k.clone(), v.clone());
                self.pos = Some(k.clone());
                Ok(Some(row))
            }
            None => {
                self.pos = None;
                Ok(None)
            }
        }
    }

    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let guard = self.data.lock().unwrap();
        match guard.rows.get(key) {
            Some(v) => {
                self.miss_at = None;
                self.pos = Some(key.to_vec());
                Ok(Some((key.to_vec(), v.clone())))
            }
            None => {
                // Leave the cursor unpositioned but remember the probed
                // key, so a subsequent next/prev continues in order
                // without claiming a match.
                self.pos = None;
                self.miss_at = Some(key.to_vec());
                Ok(None)
            }
        }
    }

    fn current(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos_key = self.pos.as_ref()?;
        let guard = self.data.lock().unwrap();
        guard.rows.get(pos_key).map(|v| (pos_key.clone(), v.clone()))
    }
}

/// An in-memory, single-process backend. Transactions are accepted but are
/// no-ops: all writes are immediately visible, matching the fact that this
/// backend has no notion of isolation to offer.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<std::collections::HashMap<String, MemoryTable>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl KvBackend for MemoryBackend {
    fn open_table(&mut self, name: &str) -> Result<Box<dyn KvTable>> {
        let mut tables = self.tables.lock().unwrap();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| MemoryTable { data: Arc::new(Mutex::new(TableData::default())) })
            .clone();
        Ok(Box::new(table))
    }

    fn supports_transactions(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("t").unwrap();
        table.put(b"k1", b"v1").unwrap();
        assert_eq!(table.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        table.delete(b"k1").unwrap();
        assert_eq!(table.get(b"k1").unwrap(), None);
    }

    #[test]
    fn open_table_twice_shares_storage() {
        let mut backend = MemoryBackend::new();
        let mut a = backend.open_table("shared").unwrap();
        let b = backend.open_table("shared").unwrap();
        a.put(b"k", b"v").unwrap();
        assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn append_assigns_sequential_keys() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("seq").unwrap();
        assert_eq!(table.append(b"a").unwrap(), 0);
        assert_eq!(table.append(b"b").unwrap(), 1);
        assert_eq!(table.high_water(), 2);
    }

    #[test]
    fn cursor_walks_forward_and_backward() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("cur").unwrap();
        for i in 0..5u32 {
            table.put(&i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        let mut cur = table.cursor();
        let mut seen = Vec::new();
        let mut row = cur.first().unwrap();
        while let Some((k, _)) = row {
            seen.push(u32::from_be_bytes(k.try_into().unwrap()));
            row = cur.next().unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let mut seen_rev = Vec::new();
        let mut row = cur.last().unwrap();
        while let Some((k, _)) = row {
            seen_rev.push(u32::from_be_bytes(k.try_into().unwrap()));
            row = cur.prev().unwrap();
        }
        assert_eq!(seen_rev, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn cursor_observes_writes_made_through_another_handle_after_creation() {
        let mut backend = MemoryBackend::new();
        let mut a = backend.open_table("shared").unwrap();
        let b = backend.open_table("shared").unwrap();
        a.put(&1u32.to_be_bytes(), b"one").unwrap();

        // Cursor created before the second write still must see it.
        let mut cur = b.cursor();
        assert_eq!(cur.first().unwrap(), Some((1u32.to_be_bytes().to_vec(), b"one".to_vec())));
        a.put(&2u32.to_be_bytes(), b"two").unwrap();
        assert_eq!(cur.next().unwrap(), Some((2u32.to_be_bytes().to_vec(), b"two".to_vec())));

        // A write made through the very same handle the cursor came from
        // must also be visible on the next step.
        let mut c = backend.open_table("shared").unwrap();
        let mut cur2 = c.cursor();
        cur2.first().unwrap();
        c.put(&3u32.to_be_bytes(), b"three").unwrap();
        let (k, _) = cur2.last().unwrap().unwrap();
        assert_eq!(u32::from_be_bytes(k.try_into().unwrap()), 3);
    }

    #[test]
    fn seek_exact_misses_but_stays_near_position() {
        let mut backend = MemoryBackend::new();
        let mut table = backend.open_table("miss").unwrap();
        table.put(&10u32.to_be_bytes(), b"x").unwrap();
        table.put(&20u32.to_be_bytes(), b"y").unwrap();
        let mut cur = table.cursor();
        assert_eq!(cur.seek_exact(&15u32.to_be_bytes()).unwrap(), None);
        // Positioned just ahead of the miss; next() continues in order.
        let (k, _) = cur.next().unwrap().unwrap();
        assert_eq!(u32::from_be_bytes(k.try_into().unwrap()), 20);
    }
}
