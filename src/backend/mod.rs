//! The capability surface the index engine requires of an external ordered
//! key/value store.
//!
//! Everything in this module is the *adapter boundary*: a real deployment
//! substitutes one of its own [`KvBackend`] implementations (backed by
//! whatever storage engine it already runs); this crate supplies exactly one
//! reference implementation, [`memory::MemoryBackend`], used by the whole
//! test suite.

pub mod memory;

use crate::error::Result;

/// An ordered cursor over a single table's byte-keyed rows.
///
/// Implementations must support bidirectional traversal and exact/inexact
/// seeking; they need not hold any lock on the row they currently sit on —
/// callers are expected to hold `&mut Database` for the duration of any
/// multi-step traversal instead.
pub trait Cursor: Send {
    fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// Position at the first row with key ≥ `key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// Position at the row with key == `key`, or leave the cursor
    /// unpositioned (but able to resume at a subsequent `next`/`prev` from
    /// wherever it last was) if absent.
    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    /// The row the cursor currently sits on, without moving it.
    fn current(&self) -> Option<(Vec<u8>, Vec<u8>)>;
}

/// A single ordered table within a [`KvBackend`].
///
/// `append` assigns the next big-endian `u64` key one past the table's
/// current high-water mark. The primary record store and the segment table
/// are the only callers; the index table always writes explicit composite
/// keys via `put`.
pub trait KvTable: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn cursor(&self) -> Box<dyn Cursor>;
    fn append(&mut self, value: &[u8]) -> Result<u64>;
    /// One past the highest key ever assigned by `append` (not affected by
    /// `delete`); callers needing record-number reuse consult the EBM
    /// instead of this value.
    fn high_water(&self) -> u64;
    /// Explicitly advance the high-water mark without writing a row, used
    /// by the deferred loader which assigns record numbers itself.
    fn set_high_water(&mut self, value: u64);
}

/// A named collection of ordered tables plus optional transaction support.
///
/// Table handles returned by `open_table` are independent views over shared
/// backing storage: two calls with the same name observe each other's
/// writes.
pub trait KvBackend: Send {
    fn open_table(&mut self, name: &str) -> Result<Box<dyn KvTable>>;

    fn supports_transactions(&self) -> bool {
        false
    }

    fn start_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn backout(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Encode a record number (or any other u32-range key) as big-endian bytes.
/// The index engine always uses this 4-byte form since record numbers and
/// segment-relative quantities fit comfortably in `u32`.
pub fn encode_key_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

pub fn decode_key_u32(bytes: &[u8]) -> Option<u32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(arr))
}
