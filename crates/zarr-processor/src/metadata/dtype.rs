//! Element types (`dtype` strings) and fill values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use zarr_common::{Result, ZarrError};

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    /// `|`: single-byte types where order is irrelevant.
    NotApplicable,
}

impl ByteOrder {
    fn symbol(&self) -> char {
        match self {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
            ByteOrder::NotApplicable => '|',
        }
    }
}

/// Logical element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
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
    /// `S<n>`: fixed-width raw bytes.
    FixedBytes(usize),
    /// `U<n>`: fixed-width text of `n` UTF-32 code units.
    FixedUnicode(usize),
}

/// A parsed `dtype`: element kind plus byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub data_type: DataType,
    pub byte_order: ByteOrder,
}

impl Dtype {
    pub fn new(data_type: DataType, byte_order: ByteOrder) -> Self {
        Self {
            data_type,
            byte_order,
        }
    }

    /// Little-endian numeric dtype, or `|` for single-byte kinds.
    pub fn little_endian(data_type: DataType) -> Self {
        let dtype = Self::new(data_type, ByteOrder::Little);
        if dtype.item_size() == 1 || matches!(data_type, DataType::FixedBytes(_)) {
            Self::new(data_type, ByteOrder::NotApplicable)
        } else {
            dtype
        }
    }

    /// Parse a dtype string such as `<f4`, `|b1` or `>U12`.
    ///
    /// `path` is only used for error reporting.
    pub fn parse(path: &str, raw: &str) -> Result<Self> {
        let unrecognized = || ZarrError::malformed(path, format!("unrecognized dtype '{}'", raw));

        let mut chars = raw.chars();
        let byte_order = match chars.next() {
            Some('<') => ByteOrder::Little,
            Some('>') => ByteOrder::Big,
            Some('|') => ByteOrder::NotApplicable,
            _ => return Err(unrecognized()),
        };
        let kind = chars.next().ok_or_else(unrecognized)?;
        let width: usize = chars.as_str().parse().map_err(|_| unrecognized())?;

        let data_type = match (kind, width) {
            ('b', 1) => DataType::Bool,
            ('i', 1) => DataType::Int8,
            ('i', 2) => DataType::Int16,
            ('i', 4) => DataType::Int32,
            ('i', 8) => DataType::Int64,
            ('u', 1) => DataType::UInt8,
            ('u', 2) => DataType::UInt16,
            ('u', 4) => DataType::UInt32,
            ('u', 8) => DataType::UInt64,
            ('f', 4) => DataType::Float32,
            ('f', 8) => DataType::Float64,
            ('S', n) if n > 0 => DataType::FixedBytes(n),
            ('U', n) if n > 0 => DataType::FixedUnicode(n),
            _ => return Err(unrecognized()),
        };

        let dtype = Self::new(data_type, byte_order);
        let order_free = dtype.item_size() == 1 || matches!(data_type, DataType::FixedBytes(_));
        if byte_order == ByteOrder::NotApplicable && !order_free {
            return Err(ZarrError::malformed(
                path,
                format!("dtype '{}' needs an explicit byte order", raw),
            ));
        }

        Ok(dtype)
    }

    /// Size of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self.data_type {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::FixedBytes(n) => n,
            DataType::FixedUnicode(n) => n * 4,
        }
    }

    pub fn is_big_endian(&self) -> bool {
        self.byte_order == ByteOrder::Big
    }

    /// The dtype string as written in `.zarray`.
    pub fn to_zarr_string(&self) -> String {
        let (kind, width) = match self.data_type {
            DataType::Bool => ('b', 1),
            DataType::Int8 => ('i', 1),
            DataType::Int16 => ('i', 2),
            DataType::Int32 => ('i', 4),
            DataType::Int64 => ('i', 8),
            DataType::UInt8 => ('u', 1),
            DataType::UInt16 => ('u', 2),
            DataType::UInt32 => ('u', 4),
            DataType::UInt64 => ('u', 8),
            DataType::Float32 => ('f', 4),
            DataType::Float64 => ('f', 8),
            DataType::FixedBytes(n) => ('S', n),
            DataType::FixedUnicode(n) => ('U', n),
        };
        format!("{}{}{}", self.byte_order.symbol(), kind, width)
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_zarr_string())
    }
}

/// The value of elements in chunks that were never written.
///
/// Keeps the JSON form from the metadata document alongside its encoding as
/// one element in the array's dtype and byte order.
#[derive(Debug, Clone, PartialEq)]
pub struct FillValue {
    json: Value,
    bytes: Vec<u8>,
}

macro_rules! encode_number {
    ($ty:ty, $value:expr, $big:expr) => {{
        let v: $ty = $value;
        if $big {
            v.to_be_bytes().to_vec()
        } else {
            v.to_le_bytes().to_vec()
        }
    }};
}

impl FillValue {
    /// Interpret a JSON fill value for `dtype`. `null` means all-zero bytes.
    pub fn parse(path: &str, dtype: &Dtype, json: &Value) -> Result<Self> {
        let invalid = || {
            ZarrError::malformed(
                path,
                format!("fill_value {} does not fit dtype {}", json, dtype),
            )
        };
        let big = dtype.is_big_endian();

        if json.is_null() {
            return Ok(Self {
                json: Value::Null,
                bytes: vec![0; dtype.item_size()],
            });
        }

        let bytes = match dtype.data_type {
            DataType::Bool => {
                let flag = match json {
                    Value::Bool(b) => *b,
                    Value::Number(n) => match n.as_u64() {
                        Some(0) => false,
                        Some(1) => true,
                        _ => return Err(invalid()),
                    },
                    _ => return Err(invalid()),
                };
                vec![flag as u8]
            }
            DataType::Int8 => encode_number!(i8, signed(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::Int16 => encode_number!(i16, signed(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::Int32 => encode_number!(i32, signed(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::Int64 => encode_number!(i64, signed(json).ok_or_else(invalid)?, big),
            DataType::UInt8 => encode_number!(u8, unsigned(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::UInt16 => encode_number!(u16, unsigned(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::UInt32 => encode_number!(u32, unsigned(json).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?, big),
            DataType::UInt64 => encode_number!(u64, unsigned(json).ok_or_else(invalid)?, big),
            DataType::Float32 => encode_number!(f32, float(json).ok_or_else(invalid)? as f32, big),
            DataType::Float64 => encode_number!(f64, float(json).ok_or_else(invalid)?, big),
            DataType::FixedBytes(n) => {
                let text = json.as_str().ok_or_else(invalid)?;
                let mut raw = BASE64.decode(text).map_err(|_| invalid())?;
                if raw.len() > n {
                    return Err(invalid());
                }
                raw.resize(n, 0);
                raw
            }
            DataType::FixedUnicode(n) => {
                let text = json.as_str().ok_or_else(invalid)?;
                let units: Vec<u32> = text.chars().map(u32::from).collect();
                if units.len() > n {
                    return Err(invalid());
                }
                let mut raw = Vec::with_capacity(n * 4);
                for unit in units {
                    raw.extend(encode_number!(u32, unit, big));
                }
                raw.resize(n * 4, 0);
                raw
            }
        };

        Ok(Self {
            json: json.clone(),
            bytes,
        })
    }

    /// All-zero fill (`fill_value: null`).
    pub fn zero(dtype: &Dtype) -> Self {
        Self {
            json: Value::Null,
            bytes: vec![0; dtype.item_size()],
        }
    }

    /// One element's worth of encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_json(&self) -> &Value {
        &self.json
    }
}

fn signed(json: &Value) -> Option<i64> {
    match json {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    }
}

fn unsigned(json: &Value) -> Option<u64> {
    match json {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        }),
        _ => None,
    }
}

fn float(json: &Value) -> Option<f64> {
    match json {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}
