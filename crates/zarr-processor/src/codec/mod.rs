//! Chunk compressors.
//!
//! Every stored chunk is one compressed blob holding the full chunk shape.
//! [`Compressor::decode`] turns it back into raw element bytes and checks the
//! length against what the metadata promises.

mod blosc;

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use serde_json::{json, Value};

use zarr_common::{Result, ZarrError};

pub use blosc::{BloscCname, Shuffle};

/// A compressor declared by an array's `compressor` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Compressor {
    /// `compressor: null`; chunks are stored raw.
    None,
    Zlib { level: u32 },
    Gzip { level: u32 },
    Zstd { level: i32 },
    /// LZ4 block prefixed with the little-endian uncompressed size.
    Lz4 { acceleration: i32 },
    Blosc {
        cname: BloscCname,
        clevel: u8,
        shuffle: Shuffle,
        blocksize: usize,
    },
}

impl Compressor {
    /// Parse the `compressor` field. Unknown ids are rejected.
    pub fn from_json(path: &str, value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Compressor::None);
        }
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ZarrError::malformed(path, "compressor without an id"))?;

        let int = |name: &str, default: i64| value.get(name).and_then(Value::as_i64).unwrap_or(default);

        match id {
            "zlib" => Ok(Compressor::Zlib {
                level: int("level", 1).clamp(0, 9) as u32,
            }),
            "gzip" => Ok(Compressor::Gzip {
                level: int("level", 1).clamp(0, 9) as u32,
            }),
            "zstd" => Ok(Compressor::Zstd {
                level: int("level", 1) as i32,
            }),
            "lz4" => Ok(Compressor::Lz4 {
                acceleration: int("acceleration", 1) as i32,
            }),
            "blosc" => {
                let cname = value.get("cname").and_then(Value::as_str).unwrap_or("lz4");
                Ok(Compressor::Blosc {
                    cname: BloscCname::from_name(cname)?,
                    clevel: int("clevel", 5).clamp(0, 9) as u8,
                    shuffle: Shuffle::from_code(int("shuffle", 1))?,
                    blocksize: int("blocksize", 0).max(0) as usize,
                })
            }
            other => Err(ZarrError::UnsupportedCompressor(other.to_string())),
        }
    }

    /// The `compressor` field for this compressor.
    pub fn to_json(&self) -> Value {
        match self {
            Compressor::None => Value::Null,
            Compressor::Zlib { level } => json!({"id": "zlib", "level": level}),
            Compressor::Gzip { level } => json!({"id": "gzip", "level": level}),
            Compressor::Zstd { level } => json!({"id": "zstd", "level": level}),
            Compressor::Lz4 { acceleration } => json!({"id": "lz4", "acceleration": acceleration}),
            Compressor::Blosc {
                cname,
                clevel,
                shuffle,
                blocksize,
            } => json!({
                "id": "blosc",
                "cname": cname.name(),
                "clevel": clevel,
                "shuffle": shuffle.code(),
                "blocksize": blocksize,
            }),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Gzip { .. } => "gzip",
            Compressor::Zstd { .. } => "zstd",
            Compressor::Lz4 { .. } => "lz4",
            Compressor::Blosc { .. } => "blosc",
        }
    }

    /// Decompress one chunk into exactly `expected_len` bytes.
    pub fn decode(&self, encoded: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let decoded = match self {
            Compressor::None => encoded.to_vec(),
            Compressor::Zlib { .. } => read_all(ZlibDecoder::new(encoded), expected_len)?,
            Compressor::Gzip { .. } => read_all(GzDecoder::new(encoded), expected_len)?,
            Compressor::Zstd { .. } => zstd::stream::decode_all(encoded)?,
            Compressor::Lz4 { .. } => lz4_flex::block::decompress_size_prepended(encoded)
                .map_err(|e| ZarrError::Decompression(format!("lz4: {}", e)))?,
            Compressor::Blosc { .. } => blosc::decompress(encoded, expected_len)?,
        };

        if decoded.len() != expected_len {
            return Err(ZarrError::Decompression(format!(
                "{} chunk decoded to {} bytes, expected {}",
                self.id(),
                decoded.len(),
                expected_len
            )));
        }
        Ok(decoded)
    }

    /// Compress raw chunk bytes. `item_size` drives blosc's shuffle.
    pub fn encode(&self, raw: &[u8], item_size: usize) -> Result<Vec<u8>> {
        use flate2::write::{GzEncoder, ZlibEncoder};
        use std::io::Write;

        match self {
            Compressor::None => Ok(raw.to_vec()),
            Compressor::Zlib { level } => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(*level));
                encoder.write_all(raw)?;
                Ok(encoder.finish()?)
            }
            Compressor::Gzip { level } => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(*level));
                encoder.write_all(raw)?;
                Ok(encoder.finish()?)
            }
            Compressor::Zstd { level } => Ok(zstd::stream::encode_all(raw, *level)?),
            Compressor::Lz4 { .. } => Ok(lz4_flex::block::compress_prepend_size(raw)),
            Compressor::Blosc {
                cname,
                clevel,
                shuffle,
                blocksize,
            } => blosc::compress(raw, item_size, *cname, *clevel, *shuffle, *blocksize),
        }
    }
}

fn read_all(mut reader: impl Read, capacity: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(capacity);
    reader.read_to_end(&mut out)?;
    Ok(out)
}
