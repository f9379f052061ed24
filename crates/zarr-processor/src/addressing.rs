//! Mapping logical row ranges onto stored chunks.
//!
//! Pure arithmetic over array metadata; no I/O. The row dimension is the
//! first dimension. For arrays of rank > 1 every chunk along the trailing
//! dimensions is needed for a row, so those indices are enumerated in full.

use crate::metadata::{join_path, ArrayMetadata};
use crate::types::RowRange;

/// Identity of one stored chunk: the array path plus its grid indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    array: String,
    indices: Vec<u64>,
}

impl ChunkKey {
    pub fn new(array: impl Into<String>, indices: Vec<u64>) -> Self {
        Self {
            array: array.into(),
            indices,
        }
    }

    pub fn array(&self) -> &str {
        &self.array
    }

    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    /// Object key of the chunk, e.g. `temp/2` or `obs/lat/0.1`.
    ///
    /// Rank 0 arrays store their single chunk under `0`.
    pub fn object_key(&self, separator: char) -> String {
        let name = if self.indices.is_empty() {
            "0".to_string()
        } else {
            self.indices
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(&separator.to_string())
        };
        join_path(&self.array, &name)
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.array, self.indices)
    }
}

/// One chunk touched by a row range and the rows of it that are wanted.
///
/// `start..end` are row offsets within the chunk along the row dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    pub key: ChunkKey,
    pub start: u64,
    pub end: u64,
}

/// Chunks covering `range`, in ascending lexicographic chunk index order.
///
/// Rows outside `[0, shape[0])` are ignored; a range with no overlap
/// yields no slices.
pub fn resolve(metadata: &ArrayMetadata, range: RowRange) -> Vec<ChunkSlice> {
    let range = range.clip(metadata.row_count());
    if range.is_empty() || metadata.rank() == 0 {
        return Vec::new();
    }

    let chunk_rows = metadata.chunk_rows();
    let first = range.start / chunk_rows;
    let last = (range.end - 1) / chunk_rows;
    let trailing = trailing_chunk_indices(metadata);

    let mut slices = Vec::with_capacity(((last - first + 1) as usize) * trailing.len());
    for row_chunk in first..=last {
        let origin = row_chunk * chunk_rows;
        let start = range.start.max(origin) - origin;
        let end = range.end.min(origin + chunk_rows) - origin;
        for tail in &trailing {
            let mut indices = Vec::with_capacity(tail.len() + 1);
            indices.push(row_chunk);
            indices.extend_from_slice(tail);
            slices.push(ChunkSlice {
                key: ChunkKey::new(metadata.path.as_str(), indices),
                start,
                end,
            });
        }
    }
    slices
}

/// Every combination of chunk indices along the trailing dimensions, in
/// lexicographic order. Rank 1 arrays have exactly one (empty) combination.
pub fn trailing_chunk_indices(metadata: &ArrayMetadata) -> Vec<Vec<u64>> {
    let grid = metadata.chunk_grid();
    let mut combos: Vec<Vec<u64>> = vec![Vec::new()];
    for &count in grid.iter().skip(1) {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                (0..count).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    combos
}
