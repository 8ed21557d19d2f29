//! Item metadata and segment addressing.
//!
//! An item is one cached object. Its bytes are cut into segments of
//! `seg_size` bytes (the last one may be shorter); segments are the unit of
//! storage, lookup and promotion.

use std::collections::BTreeSet;
use std::ops::{Range, RangeInclusive};

use serde::{Deserialize, Serialize};

/// Smallest segment size handed out by [`seg_size_for`].
pub const MIN_SEG_SIZE: u64 = 1024 * 1024;

/// Largest segment size handed out by [`seg_size_for`].
pub const MAX_SEG_SIZE: u64 = 64 * 1024 * 1024;

/// Number of segments an object is split into before clamping.
pub const TARGET_SEG_COUNT: u64 = 1024;

/// Segment size for an object of `size` bytes: `size / 1024` clamped to
/// `[1 MiB, 64 MiB]`.
pub fn seg_size_for(size: u64) -> u64 {
    (size / TARGET_SEG_COUNT).clamp(MIN_SEG_SIZE, MAX_SEG_SIZE)
}

/// Catalogue entry for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Expiry as unix seconds. Interpreted only by callers (matchers).
    pub expire: i64,

    /// Total object length in bytes.
    pub size: u64,

    /// Segment granularity in bytes, always > 0.
    pub seg_size: u64,

    /// Indices of segments whose bytes have been stored.
    pub segments: BTreeSet<u32>,
}

impl Item {
    /// A freshly registered item with no segments populated.
    pub fn new(expire: i64, size: u64, seg_size: u64) -> Self {
        Self {
            expire,
            size,
            seg_size: seg_size.max(1),
            segments: BTreeSet::new(),
        }
    }

    /// Number of segments the object spans, saturating at `u32::MAX`.
    pub fn segment_count(&self) -> u32 {
        u32::try_from(self.size.div_ceil(self.seg_size)).unwrap_or(u32::MAX)
    }

    /// Byte range of segment `idx`, capped at the object size.
    pub fn segment_bytes(&self, idx: u32) -> Range<u64> {
        let start = u64::from(idx) * self.seg_size;
        let end = (start + self.seg_size).min(self.size);
        start..end
    }

    /// Segments to scan for a read of `[start, end]`.
    ///
    /// Both ends map by integer division and the range is inclusive, so a
    /// read ending exactly on a boundary also covers the following segment.
    /// The upper end never passes the last real segment. `None` when the
    /// object is empty or `start` lies past its end.
    pub fn read_segments(&self, start: u64, end: u64) -> Option<RangeInclusive<u32>> {
        let count = self.segment_count();
        if count == 0 {
            return None;
        }
        let first = start / self.seg_size;
        let last = (end / self.seg_size).min(u64::from(count - 1));
        if first > last {
            return None;
        }
        Some(first as u32..=last as u32)
    }

    /// Segments whose whole byte range lies inside `[start, end)`.
    ///
    /// A write only marks segments it fully covers; the final segment counts
    /// as covered when the write reaches the end of the object.
    pub fn covered_segments(&self, start: u64, end: u64) -> Range<u32> {
        let first = start.div_ceil(self.seg_size);
        let last = if end >= self.size {
            u64::from(self.segment_count())
        } else {
            end / self.seg_size
        };
        if first >= last {
            return 0..0;
        }
        first as u32..last as u32
    }

    /// Segments that `[start, end)` touches at all, covered or not.
    pub fn touched_segments(&self, start: u64, end: u64) -> Range<u32> {
        if start >= end || start >= self.size {
            return 0..0;
        }
        let first = start / self.seg_size;
        let last = (end.min(self.size) - 1) / self.seg_size;
        first as u32..last as u32 + 1
    }

    /// Whether every segment has been stored.
    pub fn is_complete(&self) -> bool {
        self.segments.len() == self.segment_count() as usize
    }

    /// Whether `expire` lies at or before `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire <= now
    }
}
