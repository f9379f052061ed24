//! Cache of decoded chunks.

mod buffer;
mod chunk_cache;

pub use buffer::ChunkBuffer;
pub use chunk_cache::ChunkCache;
