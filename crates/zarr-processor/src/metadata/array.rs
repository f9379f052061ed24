//! Array metadata (`.zarray`).

use serde::Deserialize;
use serde_json::{json, Map, Value};

use zarr_common::{Result, ZarrError};

use super::dtype::{Dtype, FillValue};
use crate::codec::Compressor;

/// Memory layout of elements within a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Row-major: the last dimension varies fastest.
    #[default]
    C,
    /// Column-major: the first dimension varies fastest.
    F,
}

impl Order {
    /// Flat position of `coords` within a block of extents `dims`.
    pub fn flat_index(&self, coords: &[u64], dims: &[u64]) -> u64 {
        let mut index = 0;
        match self {
            Order::C => {
                for (c, d) in coords.iter().zip(dims) {
                    index = index * d + c;
                }
            }
            Order::F => {
                for (c, d) in coords.iter().zip(dims).rev() {
                    index = index * d + c;
                }
            }
        }
        index
    }

    /// Inverse of [`Order::flat_index`].
    pub fn coords(&self, mut index: u64, dims: &[u64]) -> Vec<u64> {
        let mut coords = vec![0; dims.len()];
        match self {
            Order::C => {
                for (slot, d) in coords.iter_mut().zip(dims).rev() {
                    *slot = index % d;
                    index /= d;
                }
            }
            Order::F => {
                for (slot, d) in coords.iter_mut().zip(dims) {
                    *slot = index % d;
                    index /= d;
                }
            }
        }
        coords
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Order::C => "C",
            Order::F => "F",
        }
    }
}

/// Parsed, validated `.zarray` document.
///
/// Immutable once built and shared between the reader, the chunk cache and
/// running scans.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    /// Array location relative to the store root, without slashes at the ends.
    pub path: String,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: Dtype,
    pub compressor: Compressor,
    pub fill_value: FillValue,
    pub order: Order,
    pub dimension_separator: char,
    pub attributes: Map<String, Value>,
}

#[derive(Deserialize)]
struct ArrayDocument {
    zarr_format: u32,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: Value,
    #[serde(default)]
    compressor: Value,
    #[serde(default)]
    fill_value: Value,
    #[serde(default)]
    order: Option<String>,
    #[serde(default)]
    filters: Option<Vec<Value>>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

impl ArrayMetadata {
    /// Parse a `.zarray` document for the array at `path`.
    pub fn from_json(path: &str, raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ZarrError::malformed(path, format!("invalid JSON: {}", e)))?;
        Self::from_value(path, &value)
    }

    /// Parse an already decoded `.zarray` document (e.g. from `.zmetadata`).
    pub fn from_value(path: &str, value: &Value) -> Result<Self> {
        let doc = ArrayDocument::deserialize(value)
            .map_err(|e| ZarrError::malformed(path, e.to_string()))?;

        if doc.zarr_format != 2 {
            return Err(ZarrError::malformed(
                path,
                format!("zarr_format {} is not supported", doc.zarr_format),
            ));
        }
        if doc.shape.len() != doc.chunks.len() {
            return Err(ZarrError::malformed(
                path,
                format!(
                    "shape has rank {} but chunks has rank {}",
                    doc.shape.len(),
                    doc.chunks.len()
                ),
            ));
        }
        if doc.chunks.iter().any(|&c| c == 0) {
            return Err(ZarrError::malformed(path, "chunk extents must be positive"));
        }

        let dtype = match &doc.dtype {
            Value::String(raw) => Dtype::parse(path, raw)?,
            other => {
                return Err(ZarrError::malformed(
                    path,
                    format!("unrecognized dtype {}", other),
                ))
            }
        };

        let chunk_bytes = checked_volume(&doc.chunks)
            .and_then(|volume| volume.checked_mul(dtype.item_size()));
        if chunk_bytes.is_none() {
            return Err(ZarrError::unsupported_shape(
                path,
                format!("chunk {:?} of {} does not fit in memory", doc.chunks, dtype),
            ));
        }
        if checked_volume(doc.shape.get(1..).unwrap_or_default()).is_none() {
            return Err(ZarrError::unsupported_shape(
                path,
                format!("row width of shape {:?} overflows", doc.shape),
            ));
        }

        let order = match doc.order.as_deref() {
            None | Some("C") => Order::C,
            Some("F") => Order::F,
            Some(other) => {
                return Err(ZarrError::malformed(path, format!("unknown order '{}'", other)))
            }
        };

        let dimension_separator = match doc.dimension_separator.as_deref() {
            None | Some(".") => '.',
            Some("/") => '/',
            Some(other) => {
                return Err(ZarrError::malformed(
                    path,
                    format!("unknown dimension_separator '{}'", other),
                ))
            }
        };

        if let Some(filter) = doc.filters.as_ref().and_then(|f| f.first()) {
            let id = filter.get("id").and_then(Value::as_str).unwrap_or("?");
            return Err(ZarrError::UnsupportedCompressor(format!("filter '{}'", id)));
        }

        let compressor = Compressor::from_json(path, &doc.compressor)?;
        let fill_value = FillValue::parse(path, &dtype, &doc.fill_value)?;

        Ok(Self {
            path: path.trim_matches('/').to_string(),
            shape: doc.shape,
            chunks: doc.chunks,
            dtype,
            compressor,
            fill_value,
            order,
            dimension_separator,
            attributes: Map::new(),
        })
    }

    /// Attach user attributes from `.zattrs`.
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// The `.zarray` document describing this array.
    pub fn to_json(&self) -> Value {
        json!({
            "zarr_format": 2,
            "shape": self.shape,
            "chunks": self.chunks,
            "dtype": self.dtype.to_zarr_string(),
            "compressor": self.compressor.to_json(),
            "fill_value": self.fill_value.to_json(),
            "order": self.order.as_str(),
            "filters": Value::Null,
            "dimension_separator": self.dimension_separator.to_string(),
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Extent of the row dimension. Rank 0 arrays have no rows.
    pub fn row_count(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Rows per chunk along the row dimension.
    pub fn chunk_rows(&self) -> u64 {
        self.chunks.first().copied().unwrap_or(1)
    }

    /// Number of chunks along each dimension (`ceil(shape / chunks)`).
    pub fn chunk_grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(s, c)| s.div_ceil(*c))
            .collect()
    }

    /// Elements per row: the product of the trailing extents.
    pub fn row_width(&self) -> u64 {
        self.shape.iter().skip(1).product()
    }

    /// Elements in one stored chunk.
    pub fn chunk_volume(&self) -> u64 {
        self.chunks.iter().product()
    }

    /// Decoded size of one stored chunk.
    pub fn chunk_byte_len(&self) -> usize {
        self.chunk_volume() as usize * self.dtype.item_size()
    }

    /// Name of the array: the last segment of its path.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Check that the array can be projected into a table column.
    pub fn check_projectable(&self) -> Result<()> {
        if self.rank() == 0 {
            return Err(ZarrError::unsupported_shape(&self.path, "rank 0 arrays have no rows"));
        }
        if let Some(d) = self.shape.iter().skip(1).position(|&s| s == 0) {
            return Err(ZarrError::unsupported_shape(
                &self.path,
                format!("dimension {} has zero extent", d + 1),
            ));
        }
        Ok(())
    }
}

/// Product of `extents` as an in-memory element count.
fn checked_volume(extents: &[u64]) -> Option<usize> {
    extents.iter().try_fold(1usize, |volume, &extent| {
        volume.checked_mul(usize::try_from(extent).ok()?)
    })
}
