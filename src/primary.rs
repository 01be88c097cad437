//! The primary record store: `record-number -> serialized
//! record bytes`, coordinating record-number assignment/reuse with the
//! existence bitmap.
//!
//! Grounded on the teacher crate's `storage::files::TableFile`
//! append-with-reuse storage, narrowed to the single `KvTable::append`
//! primitive since record-number reuse here is driven entirely by the EBM's
//! freed-record bookkeeping rather than a page free-list.

use crate::backend::{KvTable, encode_key_u32};
use crate::ebm::ExistenceBitmap;
use crate::error::{Context, Error, Result};

/// One file's primary record store.
pub struct PrimaryStore {
    table: Box<dyn KvTable>,
}

impl PrimaryStore {
    pub fn open(table: Box<dyn KvTable>) -> Self {
        PrimaryStore { table }
    }

    /// Assign a record number — the lowest number the EBM reports free, else
    /// one past the current high-water mark — write `value` under it, and
    /// mark the EBM bit. Returns the assigned record number.
    pub fn put(&mut self, value: &[u8], ebm: &mut ExistenceBitmap) -> Result<u64> {
        let record = match ebm.first_free()? {
            Some(r) => r,
            None => ebm.high_water(),
        };
        self.table.put(&encode_key_u32(record as u32), value)?;
        ebm.set(record)?;
        Ok(record)
    }

    /// The deferred loader's append-only variant: `record` must be exactly
    /// one past the current high-water mark (reuse is disallowed while
    /// loading); see [`crate::error::Error::CannotReuseRecordNumber`].
    pub fn put_sequential(&mut self, record: u64, value: &[u8], ebm: &mut ExistenceBitmap) -> Result<()> {
        let expected = ebm.high_water();
        if record != expected {
            return Err(Error::CannotReuseRecordNumber {
                requested: record,
                expected,
                ctx: Context::new().with_record(record),
            });
        }
        self.table.put(&encode_key_u32(record as u32), value)?;
        ebm.set(record)?;
        Ok(())
    }

    pub fn get(&self, record: u64) -> Result<Option<Vec<u8>>> {
        self.table.get(&encode_key_u32(record as u32))
    }

    /// Read and remove `record`'s bytes, clearing its EBM bit. Errors with
    /// [`Error::NotFound`] if the record does not exist.
    pub fn delete(&mut self, record: u64, ebm: &mut ExistenceBitmap) -> Result<Vec<u8>> {
        let key = encode_key_u32(record as u32);
        let Some(old) = self.table.get(&key)? else {
            return Err(Error::not_found(Context::new().with_record(record)));
        };
        self.table.delete(&key)?;
        ebm.clear(record)?;
        Ok(old)
    }

    /// Overwrite `record`'s bytes in place. The record number, and the EBM,
    /// are unaffected — this is the "edit keeps its number" half of the
    /// edit pipeline.
    pub fn replace(&mut self, record: u64, value: &[u8]) -> Result<()> {
        let key = encode_key_u32(record as u32);
        if self.table.get(&key)?.is_none() {
            return Err(Error::not_found(Context::new().with_record(record)));
        }
        self.table.put(&key, value)
    }
}
