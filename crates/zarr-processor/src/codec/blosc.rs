//! Blosc chunks, decoded and encoded through zarrs' c-blosc binding.
//!
//! A blosc frame is self-describing: the header carries the inner codec,
//! shuffle mode, type size and decoded length. The declared `cname`,
//! `clevel` and `shuffle` only matter when writing.

use std::borrow::Cow;

use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::{BytesToBytesCodecTraits, CodecOptions};
use zarrs::array::BytesRepresentation;

use zarr_common::{Result, ZarrError};

/// Codec applied to each stream inside a blosc block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloscCname {
    BloscLz,
    Lz4,
    Lz4hc,
    Zlib,
    Zstd,
}

impl BloscCname {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "blosclz" => Ok(BloscCname::BloscLz),
            "lz4" => Ok(BloscCname::Lz4),
            "lz4hc" => Ok(BloscCname::Lz4hc),
            "zlib" => Ok(BloscCname::Zlib),
            "zstd" => Ok(BloscCname::Zstd),
            other => Err(ZarrError::UnsupportedCompressor(format!("blosc/{}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BloscCname::BloscLz => "blosclz",
            BloscCname::Lz4 => "lz4",
            BloscCname::Lz4hc => "lz4hc",
            BloscCname::Zlib => "zlib",
            BloscCname::Zstd => "zstd",
        }
    }

    fn compressor(&self) -> BloscCompressor {
        match self {
            BloscCname::BloscLz => BloscCompressor::BloscLZ,
            BloscCname::Lz4 => BloscCompressor::LZ4,
            BloscCname::Lz4hc => BloscCompressor::LZ4HC,
            BloscCname::Zlib => BloscCompressor::Zlib,
            BloscCname::Zstd => BloscCompressor::Zstd,
        }
    }
}

/// Pre-compression reordering of a block's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    None,
    Byte,
    Bit,
}

impl Shuffle {
    /// numcodecs shuffle code. `-1` (auto) resolves to byte shuffle.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Shuffle::None),
            1 | -1 => Ok(Shuffle::Byte),
            2 => Ok(Shuffle::Bit),
            other => Err(ZarrError::UnsupportedCompressor(format!(
                "blosc shuffle {}",
                other
            ))),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Shuffle::None => 0,
            Shuffle::Byte => 1,
            Shuffle::Bit => 2,
        }
    }

    fn mode(&self) -> BloscShuffleMode {
        match self {
            Shuffle::None => BloscShuffleMode::NoShuffle,
            Shuffle::Byte => BloscShuffleMode::Shuffle,
            Shuffle::Bit => BloscShuffleMode::BitShuffle,
        }
    }
}

/// Build the zarrs codec for a declared blosc configuration.
fn codec(
    cname: BloscCname,
    clevel: u8,
    shuffle: Shuffle,
    blocksize: usize,
    typesize: usize,
) -> Result<BloscCodec> {
    let level = BloscCompressionLevel::try_from(clevel)
        .map_err(|_| ZarrError::UnsupportedCompressor(format!("blosc clevel {}", clevel)))?;
    let blocksize = (blocksize > 0).then_some(blocksize);

    BloscCodec::new(
        cname.compressor(),
        level,
        blocksize,
        shuffle.mode(),
        Some(typesize.max(1)),
    )
    .map_err(|e| ZarrError::UnsupportedCompressor(format!("blosc: {}", e)))
}

/// Decode one blosc frame holding `expected_len` bytes.
pub fn decompress(src: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    // Frame headers override these settings on decode.
    let codec = codec(BloscCname::Lz4, 5, Shuffle::None, 0, 1)?;
    let decoded = codec
        .decode(
            Cow::Borrowed(src),
            &BytesRepresentation::FixedSize(expected_len as u64),
            &CodecOptions::default(),
        )
        .map_err(|e| ZarrError::Decompression(format!("blosc: {}", e)))?;
    Ok(decoded.into_owned())
}

/// Encode raw chunk bytes into one blosc frame.
pub fn compress(
    raw: &[u8],
    typesize: usize,
    cname: BloscCname,
    clevel: u8,
    shuffle: Shuffle,
    blocksize: usize,
) -> Result<Vec<u8>> {
    let codec = codec(cname, clevel, shuffle, blocksize, typesize)?;
    let encoded = codec
        .encode(Cow::Borrowed(raw), &CodecOptions::default())
        .map_err(|e| ZarrError::Internal(format!("blosc encode: {}", e)))?;
    Ok(encoded.into_owned())
}
