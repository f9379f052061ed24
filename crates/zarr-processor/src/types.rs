//! Core types shared by the addressing, cache and scan layers.

use serde::{Deserialize, Serialize};

/// A half-open range of logical rows `[start, end)`.
///
/// Rows index the first (slowest varying) dimension of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: u64,
    pub end: u64,
}

impl RowRange {
    /// Create a range. An inverted range is normalized to an empty one.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// The unbounded range, clipped later against the table's row count.
    pub fn all() -> Self {
        Self::new(0, u64::MAX)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Restrict the range to `[0, row_count)`.
    pub fn clip(&self, row_count: u64) -> Self {
        let end = self.end.min(row_count);
        Self::new(self.start.min(end), end)
    }

    /// The rows present in both ranges.
    pub fn intersect(&self, other: &RowRange) -> Self {
        let start = self.start.max(other.start);
        Self::new(start, self.end.min(other.end))
    }

    /// Split into consecutive ranges of at most `batch_rows` rows.
    pub fn batches(&self, batch_rows: u64) -> Vec<RowRange> {
        let step = batch_rows.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = start.saturating_add(step).min(self.end);
            out.push(RowRange::new(start, end));
            start = end;
        }
        out
    }
}

impl std::fmt::Display for RowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that started a fetch.
    pub misses: u64,
    /// Lookups that joined a fetch already in flight.
    pub joined: u64,
    /// Chunks synthesized from the fill value because the object was absent.
    pub fills: u64,
    pub evictions: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub budget_bytes: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 - 1.0).
    ///
    /// Joined lookups count as hits: they did not cause a fetch.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.joined;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
