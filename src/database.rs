//! The top-level per-file handle: ties the primary store,
//! existence bitmap, and one index table per field together behind a single
//! segment-size configuration, and implements the non-deferred update
//! pipeline.
//!
//! Grounded on the teacher crate's `storage::catalog::Catalog` as the
//! "one handle owns all of a file's on-disk tables" pattern, generalised
//! from a fixed SQL catalog of columns to a caller-declared set of indexed
//! fields.

use std::collections::{BTreeSet, HashMap};

use bincode::{Decode, Encode};

use crate::backend::KvBackend;
use crate::config::DatabaseConfig;
use crate::control;
use crate::cursor::Cursor;
use crate::ebm::ExistenceBitmap;
use crate::error::{Context, Error, Result};
use crate::index_table::IndexTable;
use crate::primary::PrimaryStore;
use crate::recordset::{Recordset, next_database_id};
use crate::segment_table::SegmentTable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
struct DbControl {
    segment_size: u32,
}

/// An application record's index contributions: for each indexed field, the
/// set of values it carries. Supplied by the caller at `put`/`delete`/`edit`
/// time since decoding a record's own bytes into field values is outside
/// this crate's scope.
pub type FieldValues<'a> = &'a [(&'a str, &'a [Vec<u8>])];

/// A single file's primary store, existence bitmap, and per-field index
/// tables, opened against one [`KvBackend`] under a fixed segment size.
pub struct Database {
    backend: Box<dyn KvBackend>,
    id: u64,
    cfg: DatabaseConfig,
    primary: PrimaryStore,
    ebm: ExistenceBitmap,
    fields: HashMap<String, IndexTable>,
    deferred: bool,
}

impl Database {
    /// Open (or create) a database over `backend` with the given segment
    /// size and set of indexed field names. If the backend already carries
    /// a database opened with a different segment size, returns
    /// [`Error::SegmentSize`] carrying the stored value; reopen with that
    /// value instead.
    pub fn open(backend: Box<dyn KvBackend>, segment_size: u32, field_names: &[&str]) -> Result<Self> {
        Self::open_with_sort_scale(backend, segment_size, crate::config::DEFAULT_SORT_SCALE, field_names)
    }

    /// As [`Self::open`], but overriding the deferred-load sort-scale
    /// (`segment_sort_scale`) instead of taking the default. Mainly
    /// useful in tests that need to exercise a merge pass without staging
    /// many thousands of records first.
    pub fn open_with_sort_scale(
        mut backend: Box<dyn KvBackend>,
        segment_size: u32,
        sort_scale: usize,
        field_names: &[&str],
    ) -> Result<Self> {
        let mut control_table = backend.open_table("control")?;
        let stored: Option<DbControl> = control::load(control_table.as_ref())?;
        match stored {
            Some(c) if c.segment_size != segment_size => {
                return Err(Error::SegmentSize { stored: c.segment_size, ctx: Context::new() });
            }
            Some(_) => {}
            None => control::save(control_table.as_mut(), &DbControl { segment_size })?,
        }
        let cfg = DatabaseConfig::new(segment_size).with_sort_scale(sort_scale);

        let primary_table = backend.open_table("primary")?;
        let primary = PrimaryStore::open(primary_table);

        let ebm_table = backend.open_table("ebm")?;
        let ebm = ExistenceBitmap::open(ebm_table, cfg)?;

        let mut fields = HashMap::new();
        for &name in field_names {
            fields.insert(name.to_string(), open_field_index(backend.as_mut(), name, cfg)?);
        }

        Ok(Database { backend, id: next_database_id(), cfg, primary, ebm, fields, deferred: false })
    }

    /// Start indexing `field`, which must not already be declared. Lets
    /// callers grow the set of indexed fields after opening, rather than
    /// requiring the full field list up front.
    pub fn add_field(&mut self, field: &str) -> Result<()> {
        if self.fields.contains_key(field) {
            return Ok(());
        }
        let table = open_field_index(self.backend.as_mut(), field, self.cfg)?;
        self.fields.insert(field.to_string(), table);
        Ok(())
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn config(&self) -> DatabaseConfig {
        self.cfg
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn field_table(&self, field: &str) -> Result<&IndexTable> {
        self.fields.get(field).ok_or_else(|| Error::not_found(Context::new().with_field(field)))
    }

    fn field_table_mut(&mut self, field: &str) -> Result<&mut IndexTable> {
        self.fields.get_mut(field).ok_or_else(|| Error::not_found(Context::new().with_field(field)))
    }

    fn apply_postings(&mut self, record: u64, indexes: FieldValues, add: bool) -> Result<()> {
        for (field, values) in indexes {
            let table = self.field_table_mut(field)?;
            for value in values.iter() {
                if add { table.add_posting(value, record)? } else { table.remove_posting(value, record)? }
            }
        }
        Ok(())
    }

    /// Assign a record number, write `value` as the primary record, and
    /// post `record` under every `(field, value)` pair in `indexes`.
    pub fn put(&mut self, value: &[u8], indexes: FieldValues) -> Result<u64> {
        if self.deferred {
            return Err(Error::NotImplementedForMode { operation: "put", ctx: Context::new() });
        }
        let record = self.primary.put(value, &mut self.ebm)?;
        self.apply_postings(record, indexes, true)?;
        Ok(record)
    }

    /// Remove every posting named by `indexes`, then delete the primary
    /// record, returning its former bytes.
    pub fn delete(&mut self, record: u64, indexes: FieldValues) -> Result<Vec<u8>> {
        if self.deferred {
            return Err(Error::NotImplementedForMode { operation: "delete", ctx: Context::new() });
        }
        self.apply_postings(record, indexes, false)?;
        self.primary.delete(record, &mut self.ebm)
    }

    /// Overwrite `record`'s primary bytes and reconcile its postings: for
    /// each field appearing in either `old_indexes` or `new_indexes`, remove
    /// postings present only in the old set and add postings present only
    /// in the new set. The record number is never reassigned.
    pub fn edit(&mut self, record: u64, old_indexes: FieldValues, new_value: &[u8], new_indexes: FieldValues) -> Result<()> {
        if self.deferred {
            return Err(Error::NotImplementedForMode { operation: "edit", ctx: Context::new() });
        }
        let mut fields: Vec<&str> = old_indexes.iter().map(|(f, _)| *f).chain(new_indexes.iter().map(|(f, _)| *f)).collect();
        fields.sort_unstable();
        fields.dedup();
        for field in fields {
            let empty: &[Vec<u8>] = &[];
            let old_values = old_indexes.iter().find(|(f, _)| *f == field).map(|(_, v)| *v).unwrap_or(empty);
            let new_values = new_indexes.iter().find(|(f, _)| *f == field).map(|(_, v)| *v).unwrap_or(empty);
            let old_set: BTreeSet<&Vec<u8>> = old_values.iter().collect();
            let new_set: BTreeSet<&Vec<u8>> = new_values.iter().collect();
            let table = self.field_table_mut(field)?;
            for value in old_set.difference(&new_set) {
                table.remove_posting(value, record)?;
            }
            for value in new_set.difference(&old_set) {
                table.add_posting(value, record)?;
            }
        }
        self.primary.replace(record, new_value)
    }

    pub fn get(&self, record: u64) -> Result<Option<Vec<u8>>> {
        self.primary.get(record)
    }

    pub fn recordset_for_value(&self, field: &str, value: &[u8]) -> Result<Recordset> {
        Recordset::from_field_value(self.id, self.cfg, self.field_table(field)?, value)
    }

    pub fn recordset_for_prefix(&self, field: &str, prefix: &[u8]) -> Result<Recordset> {
        Recordset::from_prefix(self.id, self.cfg, self.field_table(field)?, prefix)
    }

    pub fn recordset_for_range(&self, field: &str, from_value: Option<&[u8]>, to_value: Option<&[u8]>) -> Result<Recordset> {
        Recordset::from_value_range(self.id, self.cfg, self.field_table(field)?, from_value, to_value)
    }

    /// Every live record, read directly from the existence bitmap.
    pub fn recordset_all(&mut self) -> Result<Recordset> {
        Recordset::from_ebm_slice(self.id, self.cfg, &mut self.ebm, None, None)
    }

    pub fn recordset_single(&self, record: u64) -> Recordset {
        Recordset::from_single_record(self.id, self.cfg, record)
    }

    pub fn cursor(&self, field: &str, partial: Option<Vec<u8>>) -> Result<Cursor<'_>> {
        Ok(Cursor::new(self.field_table(field)?, self.cfg, partial))
    }

    pub fn supports_transactions(&self) -> bool {
        self.backend.supports_transactions()
    }

    pub fn start_transaction(&mut self) -> Result<()> {
        self.backend.start_transaction()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.backend.commit()
    }

    pub fn backout(&mut self) -> Result<()> {
        self.backend.backout()
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn KvBackend {
        self.backend.as_mut()
    }

    pub(crate) fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub(crate) fn field_table_for_merge(&mut self, field: &str) -> Option<&mut IndexTable> {
        self.fields.get_mut(field)
    }

    /// As [`Self::put`]'s record assignment, but requiring `record` to equal
    /// the current high-water mark rather than reusing a freed number. Used
    /// by the deferred loader, which never reuses record numbers mid-load.
    pub(crate) fn put_sequential(&mut self, record: u64, value: &[u8]) -> Result<()> {
        self.primary.put_sequential(record, value, &mut self.ebm)
    }

    pub(crate) fn ebm_mut(&mut self) -> &mut ExistenceBitmap {
        &mut self.ebm
    }

    pub(crate) fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }
}

fn open_field_index(backend: &mut dyn KvBackend, field: &str, cfg: DatabaseConfig) -> Result<IndexTable> {
    let rows = backend.open_table(&format!("idx_{field}_rows"))?;
    let list_table = backend.open_table(&format!("idx_{field}_list"))?;
    let bitmap_table = backend.open_table(&format!("idx_{field}_bits"))?;
    let segments = SegmentTable::open(list_table, bitmap_table)?;
    Ok(IndexTable::open(rows, segments, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn open(segment_size: u32) -> Database {
        Database::open(Box::new(MemoryBackend::new()), segment_size, &["color", "shape"]).unwrap()
    }

    #[test]
    fn put_assigns_record_and_postings() {
        let mut db = open(128);
        let r = db.put(b"first", &[("color", &[b"red".to_vec()])]).unwrap();
        assert_eq!(db.get(r).unwrap(), Some(b"first".to_vec()));
        let rs = db.recordset_for_value("color", b"red").unwrap();
        assert!(rs.contains(r));
    }

    #[test]
    fn delete_removes_primary_and_postings() {
        let mut db = open(128);
        let r = db.put(b"first", &[("color", &[b"red".to_vec()])]).unwrap();
        let old = db.delete(r, &[("color", &[b"red".to_vec()])]).unwrap();
        assert_eq!(old, b"first".to_vec());
        assert!(db.get(r).unwrap().is_none());
        let rs = db.recordset_for_value("color", b"red").unwrap();
        assert!(!rs.contains(r));
    }

    #[test]
    fn edit_reconciles_postings_and_keeps_record_number() {
        let mut db = open(128);
        let r = db.put(b"first", &[("color", &[b"red".to_vec()])]).unwrap();
        db.edit(r, &[("color", &[b"red".to_vec()])], b"second", &[("color", &[b"blue".to_vec()])]).unwrap();
        assert_eq!(db.get(r).unwrap(), Some(b"second".to_vec()));
        assert!(!db.recordset_for_value("color", b"red").unwrap().contains(r));
        assert!(db.recordset_for_value("color", b"blue").unwrap().contains(r));
    }

    #[test]
    fn edit_adds_field_absent_from_old_indexes() {
        let mut db = open(128);
        let r = db.put(b"first", &[]).unwrap();
        db.edit(r, &[], b"first", &[("shape", &[b"round".to_vec()])]).unwrap();
        assert!(db.recordset_for_value("shape", b"round").unwrap().contains(r));
    }

    #[test]
    fn mismatched_segment_size_on_reopen_is_rejected() {
        let mut backend = MemoryBackend::new();
        {
            let mut control_table = backend.open_table("control").unwrap();
            control::save(control_table.as_mut(), &DbControl { segment_size: 256 }).unwrap();
        }
        let err = Database::open(Box::new(backend), 128, &[]).unwrap_err();
        match err {
            Error::SegmentSize { stored, .. } => assert_eq!(stored, 256),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn has_field_reflects_open_time_declaration() {
        let db = open(128);
        assert!(db.has_field("color"));
        assert!(!db.has_field("weight"));
    }

    #[test]
    fn add_field_extends_the_index_set_after_open() {
        let mut db = open(128);
        assert!(!db.has_field("weight"));
        db.add_field("weight").unwrap();
        assert!(db.has_field("weight"));
        let r = db.put(b"x", &[("weight", &[b"10".to_vec()])]).unwrap();
        assert!(db.recordset_for_value("weight", b"10").unwrap().contains(r));
    }

    #[test]
    fn cursor_over_a_field_walks_in_order() {
        let mut db = open(16);
        db.put(b"a", &[("color", &[b"blue".to_vec()])]).unwrap();
        db.put(b"b", &[("color", &[b"green".to_vec()])]).unwrap();
        let mut cursor = db.cursor("color", None).unwrap();
        let mut seen = Vec::new();
        let mut row = cursor.first().unwrap();
        while let Some((v, _)) = row {
            seen.push(v);
            row = cursor.next().unwrap();
        }
        assert_eq!(seen, vec![b"blue".to_vec(), b"green".to_vec()]);
    }
}
