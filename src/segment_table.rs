//! Auxiliary page store for out-of-line `List`/`Bits` segment payloads
//! (§4.2).
//!
//! Grounded on the teacher crate's `storage::files::TableFile`/`IndexFile`:
//! append-with-reuse storage, split here into two independent tables — one
//! for list pages, one for bitmap pages — since the two payload kinds are
//! never interchangeable. Free page-ids are stacked (LIFO) rather than kept
//! in a free-space map, matching the teacher's `free_block` behaviour.

use bincode::{Decode, Encode};

use crate::backend::{KvTable, encode_key_u32};
use crate::control;
use crate::error::{Context, Error, Result};
use crate::segment::Form;

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
struct FreeLists {
    list_pool: Vec<u64>,
    bitmap_pool: Vec<u64>,
}

/// A page-id store for one field's out-of-line segment payloads, backed by
/// two physically separate tables (list pages, bitmap pages) sharing a
/// single free-stack control record persisted in the list table.
///
/// Page-ids are table-local: two `SegmentTable`s (e.g. for two different
/// fields) never share an id space.
pub struct SegmentTable {
    list_table: Box<dyn KvTable>,
    bitmap_table: Box<dyn KvTable>,
    free: FreeLists,
}

impl SegmentTable {
    /// Open (or create) a segment table backed by `list_table` and
    /// `bitmap_table`, restoring its free-page stacks from the control
    /// record if present.
    pub fn open(list_table: Box<dyn KvTable>, bitmap_table: Box<dyn KvTable>) -> Result<Self> {
        let free = control::load::<FreeLists>(list_table.as_ref())?.unwrap_or_default();
        Ok(SegmentTable { list_table, bitmap_table, free })
    }

    fn persist_free(&mut self) -> Result<()> {
        let free = self.free.clone();
        control::save(self.list_table.as_mut(), &free)
    }

    fn table_for(&mut self, form: Form) -> Result<&mut Box<dyn KvTable>> {
        match form {
            Form::List => Ok(&mut self.list_table),
            Form::Bits => Ok(&mut self.bitmap_table),
            Form::Int => Err(Error::backend("Int segments have no page payload", Context::new())),
        }
    }

    /// Store `bytes` under a fresh or reused page-id from `form`'s pool,
    /// returning the id.
    pub fn alloc(&mut self, form: Form, bytes: &[u8]) -> Result<u64> {
        let pool = match form {
            Form::List => &mut self.free.list_pool,
            Form::Bits => &mut self.free.bitmap_pool,
            Form::Int => {
                return Err(Error::backend("Int segments have no page payload", Context::new()));
            }
        };
        let reused = pool.pop();
        let table = self.table_for(form)?;
        let page_id = match reused {
            Some(id) => {
                table.put(&encode_key_u32(id as u32), bytes)?;
                id
            }
            None => table.append(bytes)?,
        };
        self.persist_free()?;
        Ok(page_id)
    }

    /// Overwrite the payload at an already-allocated page-id (the segment
    /// stayed the same form but its contents changed length).
    pub fn put(&mut self, form: Form, page_id: u64, bytes: &[u8]) -> Result<()> {
        self.table_for(form)?.put(&encode_key_u32(page_id as u32), bytes)
    }

    pub fn get(&self, form: Form, page_id: u64) -> Result<Vec<u8>> {
        let table = match form {
            Form::List => &self.list_table,
            Form::Bits => &self.bitmap_table,
            Form::Int => return Err(Error::backend("Int segments have no page payload", Context::new())),
        };
        match table.get(&encode_key_u32(page_id as u32))? {
            Some(bytes) => Ok(bytes),
            None => Err(Error::MissingSegmentPage { page_id, ctx: Context::new() }),
        }
    }

    /// Release `page_id` back to `form`'s free-page stack for later reuse.
    pub fn free(&mut self, form: Form, page_id: u64) -> Result<()> {
        self.table_for(form)?.delete(&encode_key_u32(page_id as u32))?;
        match form {
            Form::List => self.free.list_pool.push(page_id),
            Form::Bits => self.free.bitmap_pool.push(page_id),
            Form::Int => return Err(Error::backend("Int segments have no page payload", Context::new())),
        }
        self.persist_free()
    }

    #[cfg(test)]
    fn free_list_pool(&self) -> &[u64] {
        &self.free.list_pool
    }

    #[cfg(test)]
    fn free_bitmap_pool(&self) -> &[u64] {
        &self.free.bitmap_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, memory::MemoryBackend};

    fn tables() -> (Box<dyn KvTable>, Box<dyn KvTable>) {
        let mut backend = MemoryBackend::new();
        (backend.open_table("segs_list").unwrap(), backend.open_table("segs_bits").unwrap())
    }

    #[test]
    fn alloc_get_round_trips() {
        let (lt, bt) = tables();
        let mut segs = SegmentTable::open(lt, bt).unwrap();
        let id = segs.alloc(Form::List, b"\x00\x01\x00\x02").unwrap();
        assert_eq!(segs.get(Form::List, id).unwrap(), b"\x00\x01\x00\x02".to_vec());
    }

    #[test]
    fn freed_page_is_reused_before_appending() {
        let (lt, bt) = tables();
        let mut segs = SegmentTable::open(lt, bt).unwrap();
        let first = segs.alloc(Form::List, b"aa").unwrap();
        let second = segs.alloc(Form::List, b"bb").unwrap();
        segs.free(Form::List, first).unwrap();
        let third = segs.alloc(Form::List, b"cc").unwrap();
        assert_eq!(third, first);
        assert_ne!(second, first);
        assert_eq!(segs.get(Form::List, third).unwrap(), b"cc".to_vec());
    }

    #[test]
    fn list_and_bitmap_pools_are_independent() {
        let (lt, bt) = tables();
        let mut segs = SegmentTable::open(lt, bt).unwrap();
        let list_id = segs.alloc(Form::List, b"aa").unwrap();
        segs.free(Form::List, list_id).unwrap();
        let bitmap_id = segs.alloc(Form::Bits, &[0u8; 16]).unwrap();
        // A freed list page must not satisfy a bitmap allocation, and the
        // two pools index into physically separate tables, so an id
        // collision between them is not even observable as a conflict.
        assert!(segs.free_list_pool().contains(&list_id));
        assert!(segs.free_bitmap_pool().is_empty());
        assert_eq!(segs.get(Form::Bits, bitmap_id).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn missing_page_is_an_error() {
        let (lt, bt) = tables();
        let segs = SegmentTable::open(lt, bt).unwrap();
        assert!(segs.get(Form::List, 999).is_err());
    }

    #[test]
    fn free_stacks_survive_reopen() {
        let mut backend = MemoryBackend::new();
        let lt = backend.open_table("persist_list").unwrap();
        let bt = backend.open_table("persist_bits").unwrap();
        let mut segs = SegmentTable::open(lt, bt).unwrap();
        let id = segs.alloc(Form::List, b"aa").unwrap();
        segs.free(Form::List, id).unwrap();
        drop(segs);

        let lt2 = backend.open_table("persist_list").unwrap();
        let bt2 = backend.open_table("persist_bits").unwrap();
        let mut reopened = SegmentTable::open(lt2, bt2).unwrap();
        assert_eq!(reopened.free_list_pool(), &[id]);
        let reused = reopened.alloc(Form::List, b"bb").unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn put_overwrites_an_existing_page() {
        let (lt, bt) = tables();
        let mut segs = SegmentTable::open(lt, bt).unwrap();
        let id = segs.alloc(Form::Bits, &[0u8; 4]).unwrap();
        segs.put(Form::Bits, id, &[0xff; 4]).unwrap();
        assert_eq!(segs.get(Form::Bits, id).unwrap(), vec![0xff; 4]);
    }
}
