//! Per-handle configuration.
//!
//! The segment size `S`, the list/bitmap promotion threshold `L`, and the
//! deferred-load sort-scale are carried on the database handle rather than
//! as process globals, so tests can override them per-handle (see the
//! design notes on "Global/module state").

/// Default segment size: 32,000 records per segment (4,000 bytes of
/// bitmap).
pub const DEFAULT_SEGMENT_SIZE: u32 = 32_000;

/// Default deferred-load sort-scale: number of segments worth of postings
/// buffered in RAM before a merge pass is forced.
pub const DEFAULT_SORT_SCALE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Number of records per segment. Must be a multiple of 16 so that
    /// `segment_size / 8` (the bitmap payload size) divides evenly into
    /// whole bytes and `segment_size / 16` (the default `L`) is a whole
    /// number of u16 list offsets.
    segment_size: u32,
    /// List→Bits promotion threshold: a segment promotes once its count
    /// exceeds this value.
    list_bitmap_threshold: u32,
    /// Deferred-load sort-scale, overridable in tests to exercise merge
    /// paths on small inputs.
    pub sort_scale: usize,
}

impl DatabaseConfig {
    pub fn new(segment_size: u32) -> Self {
        DatabaseConfig {
            segment_size,
            list_bitmap_threshold: default_threshold(segment_size),
            sort_scale: DEFAULT_SORT_SCALE,
        }
    }

    pub fn with_threshold(mut self, list_bitmap_threshold: u32) -> Self {
        self.list_bitmap_threshold = list_bitmap_threshold;
        self
    }

    pub fn with_sort_scale(mut self, sort_scale: usize) -> Self {
        self.sort_scale = sort_scale;
        self
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// `L`: the list↔bitmap promotion threshold.
    pub fn list_bitmap_threshold(&self) -> u32 {
        self.list_bitmap_threshold
    }

    /// Bits→List demotion threshold. Chosen a quarter of `L` below `L`
    /// itself so a count oscillating around `L` does not flap between
    /// encodings (see DESIGN.md's hysteresis-band decision).
    pub fn bitmap_demote_threshold(&self) -> u32 {
        self.list_bitmap_threshold.saturating_sub(self.list_bitmap_threshold / 4).max(1)
    }

    /// Number of bytes in a full segment bitmap payload (`S/8`).
    pub fn bitmap_bytes(&self) -> usize {
        (self.segment_size as usize).div_ceil(8)
    }

    pub fn segment_of(&self, record: u64) -> u32 {
        (record / self.segment_size as u64) as u32
    }

    pub fn offset_in_segment(&self, record: u64) -> u32 {
        (record % self.segment_size as u64) as u32
    }

    pub fn absolute(&self, segment: u32, offset: u32) -> u64 {
        segment as u64 * self.segment_size as u64 + offset as u64
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::new(DEFAULT_SEGMENT_SIZE)
    }
}

fn default_threshold(segment_size: u32) -> u32 {
    (segment_size / 16).max(2)
}
