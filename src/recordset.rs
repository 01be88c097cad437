//! In-memory, segment-sparse record sets and their set algebra.
//!
//! Grounded on the original implementation's `recordset`/`segmentset`
//! modules (see `original_source/solentware_base/core/tests/`): a
//! recordset never flattens to a flat integer list, instead holding one
//! [`Segment`] per segment-number that actually has members, and combining
//! two recordsets by walking both segment maps in merged order. The
//! in-place `*_assign` operators and `place`/`remove` are carried over
//! from the original's dunder-method surface (`__or__`, `__iand__`, …),
//! reimplemented as plain methods per the redesign notes on operator
//! overloading.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DatabaseConfig;
use crate::ebm::ExistenceBitmap;
use crate::error::{Error, Result};
use crate::index_table::{IndexRow, IndexTable};
use crate::segment::{Form, Segment};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// A fresh identity token for a newly opened database handle. Recordsets
/// (and cursors) built from two different ids may never be combined; see
/// [`Recordset::union`] and friends.
pub fn next_database_id() -> u64 {
    NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A segment-sparse set of record numbers, scoped to a single database
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recordset {
    database_id: u64,
    cfg: DatabaseConfig,
    segments: BTreeMap<u32, Segment>,
}

impl Recordset {
    pub fn empty(database_id: u64, cfg: DatabaseConfig) -> Self {
        Recordset { database_id, cfg, segments: BTreeMap::new() }
    }

    pub fn from_single_record(database_id: u64, cfg: DatabaseConfig, record: u64) -> Self {
        let segment_number = cfg.segment_of(record);
        let offset = cfg.offset_in_segment(record);
        let mut segments = BTreeMap::new();
        segments.insert(segment_number, Segment::single(segment_number, offset));
        Recordset { database_id, cfg, segments }
    }

    /// All records posted under `value` in `index`.
    pub fn from_field_value(database_id: u64, cfg: DatabaseConfig, index: &IndexTable, value: &[u8]) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for row in index.iter_field_value(value)? {
            let (segment_number, segment) = row?;
            segments.insert(segment_number, segment);
        }
        Ok(Recordset { database_id, cfg, segments })
    }

    /// All records whose indexed value starts with `prefix`.
    pub fn from_prefix(database_id: u64, cfg: DatabaseConfig, index: &IndexTable, prefix: &[u8]) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for row in index.iter_field(Some(prefix), None, true)? {
            let row = row?;
            if !row.value.starts_with(prefix) {
                break;
            }
            merge_row(&mut segments, row, &cfg)?;
        }
        Ok(Recordset { database_id, cfg, segments })
    }

    /// All records whose indexed value falls in `[from_value, to_value]`
    /// (either bound optional).
    pub fn from_value_range(
        database_id: u64,
        cfg: DatabaseConfig,
        index: &IndexTable,
        from_value: Option<&[u8]>,
        to_value: Option<&[u8]>,
    ) -> Result<Self> {
        let mut segments = BTreeMap::new();
        for row in index.iter_field(from_value, to_value, true)? {
            merge_row(&mut segments, row?, &cfg)?;
        }
        Ok(Recordset { database_id, cfg, segments })
    }

    /// All live records in `[from_record, to_record]`, read directly from
    /// the existence bitmap.
    pub fn from_ebm_slice(
        database_id: u64,
        cfg: DatabaseConfig,
        ebm: &mut ExistenceBitmap,
        from_record: Option<u64>,
        to_record: Option<u64>,
    ) -> Result<Self> {
        let mut segments = BTreeMap::new();
        if ebm.high_water() == 0 {
            return Ok(Recordset { database_id, cfg, segments });
        }
        let from_segment = from_record.map(|r| cfg.segment_of(r)).unwrap_or(0);
        let to_segment = to_record.map(|r| cfg.segment_of(r)).unwrap_or_else(|| ebm.highest_segment());
        let to_segment = to_segment.min(ebm.highest_segment());
        for segment_number in from_segment..=to_segment {
            let bytes = ebm.segment_bitmap(segment_number)?;
            if bytes.iter().all(|&b| b == 0) {
                continue;
            }
            let mut segment = Segment::decode(Form::Bits, &bytes, segment_number, &cfg)?;
            if from_record.map(|r| cfg.segment_of(r)) == Some(segment_number) {
                let lower = cfg.offset_in_segment(from_record.unwrap());
                for offset in 0..lower {
                    segment.remove(offset, &cfg);
                }
            }
            if to_record.map(|r| cfg.segment_of(r)) == Some(segment_number) {
                let upper = cfg.offset_in_segment(to_record.unwrap());
                for offset in (upper + 1)..cfg.segment_size() {
                    segment.remove(offset, &cfg);
                }
            }
            if segment.count() > 0 {
                segments.insert(segment_number, segment);
            }
        }
        Ok(Recordset { database_id, cfg, segments })
    }

    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn count(&self) -> u64 {
        self.segments.values().map(|s| s.count() as u64).sum()
    }

    pub fn contains(&self, record: u64) -> bool {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        self.segments.get(&segment_number).is_some_and(|s| s.contains(offset))
    }

    /// Absolute record numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments.iter().flat_map(move |(&segment_number, segment)| {
            segment.iter().map(move |offset| self.cfg.absolute(segment_number, offset))
        })
    }

    /// Add `record`, but only if the existence bitmap says it is live.
    /// Returns whether it was added (`false` both when already present and
    /// when not live).
    pub fn place(&mut self, ebm: &mut ExistenceBitmap, record: u64) -> Result<bool> {
        if !ebm.contains(record)? {
            return Ok(false);
        }
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let changed = match self.segments.get_mut(&segment_number) {
            Some(segment) => segment.insert(offset, &self.cfg),
            None => {
                self.segments.insert(segment_number, Segment::single(segment_number, offset));
                true
            }
        };
        Ok(changed)
    }

    pub fn remove(&mut self, record: u64) -> bool {
        let segment_number = self.cfg.segment_of(record);
        let offset = self.cfg.offset_in_segment(record);
        let Some(segment) = self.segments.get_mut(&segment_number) else {
            return false;
        };
        let changed = segment.remove(offset, &self.cfg);
        if segment.count() == 0 {
            self.segments.remove(&segment_number);
        }
        changed
    }

    fn check_same_database(&self, other: &Recordset) -> Result<()> {
        if self.database_id != other.database_id { Err(Error::cross_database()) } else { Ok(()) }
    }

    pub fn union(&self, other: &Recordset) -> Result<Recordset> {
        self.check_same_database(other)?;
        let mut result = BTreeMap::new();
        for segment_number in all_segment_numbers(self, other) {
            let merged = match (self.segments.get(&segment_number), other.segments.get(&segment_number)) {
                (Some(a), Some(b)) => a.union(b, &self.cfg)?,
                (Some(a), None) => a.clone(),
                (None, Some(b)) => b.clone(),
                (None, None) => unreachable!("segment number came from one of the two maps"),
            };
            result.insert(segment_number, merged);
        }
        Ok(Recordset { database_id: self.database_id, cfg: self.cfg, segments: result })
    }

    pub fn intersection(&self, other: &Recordset) -> Result<Recordset> {
        self.check_same_database(other)?;
        let mut result = BTreeMap::new();
        for (segment_number, a) in &self.segments {
            if let Some(b) = other.segments.get(segment_number) {
                if let Some(merged) = a.intersection(b, &self.cfg)? {
                    result.insert(*segment_number, merged);
                }
            }
        }
        Ok(Recordset { database_id: self.database_id, cfg: self.cfg, segments: result })
    }

    /// `self - other`.
    pub fn difference(&self, other: &Recordset) -> Result<Recordset> {
        self.check_same_database(other)?;
        let mut result = BTreeMap::new();
        for (segment_number, a) in &self.segments {
            match other.segments.get(segment_number) {
                Some(b) => {
                    if let Some(merged) = a.difference(b, &self.cfg)? {
                        result.insert(*segment_number, merged);
                    }
                }
                None => {
                    result.insert(*segment_number, a.clone());
                }
            }
        }
        Ok(Recordset { database_id: self.database_id, cfg: self.cfg, segments: result })
    }

    pub fn symmetric_difference(&self, other: &Recordset) -> Result<Recordset> {
        self.check_same_database(other)?;
        let mut result = BTreeMap::new();
        for segment_number in all_segment_numbers(self, other) {
            match (self.segments.get(&segment_number), other.segments.get(&segment_number)) {
                (Some(a), Some(b)) => {
                    if let Some(merged) = a.symmetric_difference(b, &self.cfg)? {
                        result.insert(segment_number, merged);
                    }
                }
                (Some(a), None) => {
                    result.insert(segment_number, a.clone());
                }
                (None, Some(b)) => {
                    result.insert(segment_number, b.clone());
                }
                (None, None) => unreachable!("segment number came from one of the two maps"),
            }
        }
        Ok(Recordset { database_id: self.database_id, cfg: self.cfg, segments: result })
    }

    pub fn union_assign(&mut self, other: &Recordset) -> Result<()> {
        *self = self.union(other)?;
        Ok(())
    }

    pub fn intersection_assign(&mut self, other: &Recordset) -> Result<()> {
        *self = self.intersection(other)?;
        Ok(())
    }

    pub fn difference_assign(&mut self, other: &Recordset) -> Result<()> {
        *self = self.difference(other)?;
        Ok(())
    }

    pub fn symmetric_difference_assign(&mut self, other: &Recordset) -> Result<()> {
        *self = self.symmetric_difference(other)?;
        Ok(())
    }
}

fn all_segment_numbers(a: &Recordset, b: &Recordset) -> impl Iterator<Item = u32> {
    let mut numbers: Vec<u32> = a.segments.keys().chain(b.segments.keys()).copied().collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers.into_iter()
}

fn merge_row(segments: &mut BTreeMap<u32, Segment>, row: IndexRow, cfg: &DatabaseConfig) -> Result<()> {
    let segment_number = row.segment.segment_number();
    match segments.remove(&segment_number) {
        Some(existing) => {
            segments.insert(segment_number, existing.union(&row.segment, cfg)?);
        }
        None => {
            segments.insert(segment_number, row.segment);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, memory::MemoryBackend};
    use crate::segment_table::SegmentTable;

    fn cfg() -> DatabaseConfig {
        DatabaseConfig::new(16).with_threshold(6)
    }

    fn ebm() -> ExistenceBitmap {
        let mut backend = MemoryBackend::new();
        let table = backend.open_table("ebm").unwrap();
        ExistenceBitmap::open(table, cfg()).unwrap()
    }

    fn index_table() -> IndexTable {
        let mut backend = MemoryBackend::new();
        let rows = backend.open_table("rows").unwrap();
        let lt = backend.open_table("list").unwrap();
        let bt = backend.open_table("bits").unwrap();
        IndexTable::open(rows, SegmentTable::open(lt, bt).unwrap(), cfg())
    }

    #[test]
    fn place_refuses_non_live_record() {
        let mut bitmap = ebm();
        bitmap.set(5).unwrap();
        let id = next_database_id();
        let mut rs = Recordset::empty(id, cfg());
        assert!(!rs.place(&mut bitmap, 9).unwrap());
        assert!(rs.place(&mut bitmap, 5).unwrap());
        assert!(rs.contains(5));
    }

    #[test]
    fn union_combines_disjoint_and_overlapping_segments() {
        let id = next_database_id();
        let a = Recordset::from_single_record(id, cfg(), 1);
        let b = Recordset::from_single_record(id, cfg(), 20);
        let union = a.union(&b).unwrap();
        assert_eq!(union.count(), 2);
        assert!(union.contains(1));
        assert!(union.contains(20));
    }

    #[test]
    fn intersection_drops_segments_with_empty_result() {
        let id = next_database_id();
        let a = Recordset::from_single_record(id, cfg(), 1);
        let b = Recordset::from_single_record(id, cfg(), 2);
        let intersection = a.intersection(&b).unwrap();
        assert!(intersection.is_empty());
    }

    #[test]
    fn difference_keeps_segment_only_present_in_a() {
        let id = next_database_id();
        let a = Recordset::from_single_record(id, cfg(), 1);
        let b = Recordset::from_single_record(id, cfg(), 20);
        let diff = a.difference(&b).unwrap();
        assert_eq!(diff.count(), 1);
        assert!(diff.contains(1));
    }

    #[test]
    fn symmetric_difference_of_equal_sets_is_empty() {
        let id = next_database_id();
        let a = Recordset::from_single_record(id, cfg(), 1);
        let b = Recordset::from_single_record(id, cfg(), 1);
        assert!(a.symmetric_difference(&b).unwrap().is_empty());
    }

    #[test]
    fn cross_database_combination_is_rejected() {
        let a = Recordset::from_single_record(next_database_id(), cfg(), 1);
        let b = Recordset::from_single_record(next_database_id(), cfg(), 1);
        assert!(a.union(&b).is_err());
    }

    #[test]
    fn from_field_value_collects_all_matching_segments() {
        let mut idx = index_table();
        idx.add_posting(b"red", 1).unwrap();
        idx.add_posting(b"red", 20).unwrap();
        let rs = Recordset::from_field_value(next_database_id(), cfg(), &idx, b"red").unwrap();
        assert_eq!(rs.count(), 2);
        assert!(rs.contains(1));
        assert!(rs.contains(20));
    }

    #[test]
    fn from_ebm_slice_respects_bounds() {
        let mut bitmap = ebm();
        for r in 0..40u64 {
            bitmap.set(r).unwrap();
        }
        let rs = Recordset::from_ebm_slice(next_database_id(), cfg(), &mut bitmap, Some(5), Some(10)).unwrap();
        assert_eq!(rs.count(), 6);
        for r in 5..=10u64 {
            assert!(rs.contains(r));
        }
        assert!(!rs.contains(4));
        assert!(!rs.contains(11));
    }

    #[test]
    fn remove_drops_empty_segment_entry() {
        let id = next_database_id();
        let mut rs = Recordset::from_single_record(id, cfg(), 1);
        assert!(rs.remove(1));
        assert!(rs.is_empty());
    }

    #[test]
    fn union_assign_mutates_in_place() {
        let id = next_database_id();
        let mut a = Recordset::from_single_record(id, cfg(), 1);
        let b = Recordset::from_single_record(id, cfg(), 2);
        a.union_assign(&b).unwrap();
        assert_eq!(a.count(), 2);
    }
}
