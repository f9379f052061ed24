//! Column types and typed column batches.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use zarr_common::{Result, ZarrError};

use crate::metadata::{ArrayMetadata, DataType, Dtype};
use crate::types::RowRange;

/// Logical type of a table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Raw bytes of a fixed width.
    FixedBinary(usize),
    /// Text of at most this many characters.
    FixedString(usize),
    /// `length` values of `element` per row, from an array of rank > 1.
    FixedSizeList {
        element: Box<ColumnType>,
        length: usize,
    },
}

impl ColumnType {
    /// Scalar column type of one element of `dtype`.
    pub fn from_dtype(dtype: &Dtype) -> Self {
        match dtype.data_type {
            DataType::Bool => ColumnType::Boolean,
            DataType::Int8 => ColumnType::Int8,
            DataType::Int16 => ColumnType::Int16,
            DataType::Int32 => ColumnType::Int32,
            DataType::Int64 => ColumnType::Int64,
            DataType::UInt8 => ColumnType::UInt8,
            DataType::UInt16 => ColumnType::UInt16,
            DataType::UInt32 => ColumnType::UInt32,
            DataType::UInt64 => ColumnType::UInt64,
            DataType::Float32 => ColumnType::Float32,
            DataType::Float64 => ColumnType::Float64,
            DataType::FixedBytes(n) => ColumnType::FixedBinary(n),
            DataType::FixedUnicode(n) => ColumnType::FixedString(n),
        }
    }

    /// Column type of a whole array: scalar for rank 1, a fixed-size list
    /// of the trailing elements otherwise.
    pub fn for_array(array: &ArrayMetadata) -> Self {
        let element = Self::from_dtype(&array.dtype);
        if array.rank() <= 1 {
            element
        } else {
            ColumnType::FixedSizeList {
                element: Box::new(element),
                length: array.row_width() as usize,
            }
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Int8 => f.write_str("int8"),
            ColumnType::Int16 => f.write_str("int16"),
            ColumnType::Int32 => f.write_str("int32"),
            ColumnType::Int64 => f.write_str("int64"),
            ColumnType::UInt8 => f.write_str("uint8"),
            ColumnType::UInt16 => f.write_str("uint16"),
            ColumnType::UInt32 => f.write_str("uint32"),
            ColumnType::UInt64 => f.write_str("uint64"),
            ColumnType::Float32 => f.write_str("float32"),
            ColumnType::Float64 => f.write_str("float64"),
            ColumnType::FixedBinary(n) => write!(f, "binary({})", n),
            ColumnType::FixedString(n) => write!(f, "string({})", n),
            ColumnType::FixedSizeList { element, length } => {
                write!(f, "list<{}, {}>", element, length)
            }
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnField {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Source array path.
    pub array: String,
    /// Zarr dtype string of the source array.
    pub dtype: String,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl ColumnField {
    pub fn from_array(name: &str, array: &ArrayMetadata) -> Self {
        Self {
            name: name.to_string(),
            column_type: ColumnType::for_array(array),
            array: array.path.clone(),
            dtype: array.dtype.to_zarr_string(),
            shape: array.shape.clone(),
            chunks: array.chunks.clone(),
            attributes: array.attributes.clone(),
        }
    }
}

/// Tabular view of an array or group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub table: String,
    pub row_count: u64,
    pub columns: Vec<ColumnField>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnField> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Materialized values of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Boolean(Vec<bool>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    FixedBinary(Vec<Vec<u8>>),
    FixedString(Vec<String>),
    /// Row-major flattened values, `length` per row.
    FixedSizeList {
        length: usize,
        values: Box<ColumnData>,
    },
}

impl ColumnData {
    fn empty(dtype: &Dtype, capacity: usize) -> Self {
        match dtype.data_type {
            DataType::Bool => ColumnData::Boolean(Vec::with_capacity(capacity)),
            DataType::Int8 => ColumnData::Int8(Vec::with_capacity(capacity)),
            DataType::Int16 => ColumnData::Int16(Vec::with_capacity(capacity)),
            DataType::Int32 => ColumnData::Int32(Vec::with_capacity(capacity)),
            DataType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            DataType::UInt8 => ColumnData::UInt8(Vec::with_capacity(capacity)),
            DataType::UInt16 => ColumnData::UInt16(Vec::with_capacity(capacity)),
            DataType::UInt32 => ColumnData::UInt32(Vec::with_capacity(capacity)),
            DataType::UInt64 => ColumnData::UInt64(Vec::with_capacity(capacity)),
            DataType::Float32 => ColumnData::Float32(Vec::with_capacity(capacity)),
            DataType::Float64 => ColumnData::Float64(Vec::with_capacity(capacity)),
            DataType::FixedBytes(_) => ColumnData::FixedBinary(Vec::with_capacity(capacity)),
            DataType::FixedUnicode(_) => ColumnData::FixedString(Vec::with_capacity(capacity)),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::FixedBinary(v) => v.len(),
            ColumnData::FixedString(v) => v.len(),
            ColumnData::FixedSizeList { length, values } => {
                if *length == 0 {
                    0
                } else {
                    values.len() / length
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON form of the value in `row`, `None` past the end.
    pub fn json_value(&self, row: usize) -> Option<Value> {
        let value = match self {
            ColumnData::Boolean(v) => Value::from(*v.get(row)?),
            ColumnData::Int8(v) => Value::from(*v.get(row)?),
            ColumnData::Int16(v) => Value::from(*v.get(row)?),
            ColumnData::Int32(v) => Value::from(*v.get(row)?),
            ColumnData::Int64(v) => Value::from(*v.get(row)?),
            ColumnData::UInt8(v) => Value::from(*v.get(row)?),
            ColumnData::UInt16(v) => Value::from(*v.get(row)?),
            ColumnData::UInt32(v) => Value::from(*v.get(row)?),
            ColumnData::UInt64(v) => Value::from(*v.get(row)?),
            // Non-finite floats become null.
            ColumnData::Float32(v) => Value::from(*v.get(row)? as f64),
            ColumnData::Float64(v) => Value::from(*v.get(row)?),
            ColumnData::FixedBinary(v) => Value::from(v.get(row)?.clone()),
            ColumnData::FixedString(v) => Value::from(v.get(row)?.as_str()),
            ColumnData::FixedSizeList { length, values } => {
                let start = row.checked_mul(*length)?;
                if row >= self.len() {
                    return None;
                }
                Value::Array(
                    (start..start + length)
                        .filter_map(|i| values.json_value(i))
                        .collect(),
                )
            }
        };
        Some(value)
    }
}

macro_rules! push_number {
    ($values:expr, $ty:ty, $raw:expr, $big:expr) => {{
        let bytes: [u8; std::mem::size_of::<$ty>()] = $raw
            .try_into()
            .map_err(|_| ZarrError::Internal(format!("element of {} bytes", $raw.len())))?;
        $values.push(if $big {
            <$ty>::from_be_bytes(bytes)
        } else {
            <$ty>::from_le_bytes(bytes)
        });
    }};
}

/// Accumulates decoded elements of one array into a [`ColumnData`].
pub(crate) struct ColumnBuilder {
    dtype: Dtype,
    list_length: Option<usize>,
    values: ColumnData,
}

impl ColumnBuilder {
    pub(crate) fn new(array: &ArrayMetadata, rows: usize) -> Self {
        let list_length = (array.rank() > 1).then(|| array.row_width() as usize);
        let capacity = rows.saturating_mul(list_length.unwrap_or(1));
        Self {
            dtype: array.dtype,
            list_length,
            values: ColumnData::empty(&array.dtype, capacity),
        }
    }

    /// Decode one element from its stored bytes.
    pub(crate) fn push(&mut self, raw: &[u8]) -> Result<()> {
        let big = self.dtype.is_big_endian();
        match &mut self.values {
            ColumnData::Boolean(v) => v.push(raw.first().is_some_and(|b| *b != 0)),
            ColumnData::Int8(v) => push_number!(v, i8, raw, big),
            ColumnData::Int16(v) => push_number!(v, i16, raw, big),
            ColumnData::Int32(v) => push_number!(v, i32, raw, big),
            ColumnData::Int64(v) => push_number!(v, i64, raw, big),
            ColumnData::UInt8(v) => push_number!(v, u8, raw, big),
            ColumnData::UInt16(v) => push_number!(v, u16, raw, big),
            ColumnData::UInt32(v) => push_number!(v, u32, raw, big),
            ColumnData::UInt64(v) => push_number!(v, u64, raw, big),
            ColumnData::Float32(v) => push_number!(v, f32, raw, big),
            ColumnData::Float64(v) => push_number!(v, f64, raw, big),
            ColumnData::FixedBinary(v) => v.push(raw.to_vec()),
            ColumnData::FixedString(v) => v.push(decode_utf32(raw, big)),
            ColumnData::FixedSizeList { .. } => {
                return Err(ZarrError::Internal("nested list builder".to_string()))
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> ColumnData {
        match self.list_length {
            Some(length) => ColumnData::FixedSizeList {
                length,
                values: Box::new(self.values),
            },
            None => self.values,
        }
    }
}

/// UTF-32 text, cut at the first NUL code unit.
fn decode_utf32(raw: &[u8], big: bool) -> String {
    raw.chunks_exact(4)
        .map(|unit| {
            let unit = [unit[0], unit[1], unit[2], unit[3]];
            if big {
                u32::from_be_bytes(unit)
            } else {
                u32::from_le_bytes(unit)
            }
        })
        .take_while(|&code| code != 0)
        .map(|code| char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// One named column of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Rows `range` of every column of a table, in ascending row order.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBatch {
    pub range: RowRange,
    pub columns: Vec<Column>,
}

impl ColumnBatch {
    pub fn num_rows(&self) -> usize {
        self.range.len() as usize
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.data)
    }

    /// One JSON object per row, keyed by column name.
    pub fn to_json_rows(&self) -> Vec<Value> {
        (0..self.num_rows())
            .map(|row| {
                let mut object = Map::new();
                for column in &self.columns {
                    object.insert(
                        column.name.clone(),
                        column.data.json_value(row).unwrap_or(Value::Null),
                    );
                }
                Value::Object(object)
            })
            .collect()
    }
}
