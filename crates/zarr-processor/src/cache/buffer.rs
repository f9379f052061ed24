//! Decoded chunk contents.

use bytes::Bytes;

use zarr_common::{Result, ZarrError};

use crate::addressing::ChunkKey;

/// Raw element bytes of one chunk, in the array's storage order.
///
/// Always holds the full chunk shape, also for edge chunks and for chunks
/// synthesized from the fill value. Immutable and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkBuffer {
    key: ChunkKey,
    item_size: usize,
    data: Bytes,
    synthesized: bool,
}

impl ChunkBuffer {
    pub fn new(key: ChunkKey, item_size: usize, data: Bytes) -> Self {
        Self {
            key,
            item_size: item_size.max(1),
            data,
            synthesized: false,
        }
    }

    /// A chunk of `volume` elements, each equal to `fill`.
    pub fn filled(key: ChunkKey, fill: &[u8], volume: usize) -> Self {
        Self {
            key,
            item_size: fill.len().max(1),
            data: Bytes::from(fill.repeat(volume)),
            synthesized: true,
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.item_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk was absent from the store.
    pub fn is_fill(&self) -> bool {
        self.synthesized
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Bytes of the element at flat position `index`.
    pub fn element(&self, index: usize) -> Result<&[u8]> {
        let start = index * self.item_size;
        self.data
            .get(start..start + self.item_size)
            .ok_or(ZarrError::OutOfBounds {
                index,
                len: self.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_access() {
        let data: Vec<u8> = [7i32, 8, 9].iter().flat_map(|v| v.to_le_bytes()).collect();
        let buffer = ChunkBuffer::new(ChunkKey::new("temp", vec![0]), 4, Bytes::from(data));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.element(1).unwrap(), &8i32.to_le_bytes());
        assert_eq!(
            buffer.element(3),
            Err(ZarrError::OutOfBounds { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_filled_chunk() {
        let buffer = ChunkBuffer::filled(ChunkKey::new("temp", vec![2]), &(-1i32).to_le_bytes(), 4);
        assert!(buffer.is_fill());
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.byte_len(), 16);
        for i in 0..4 {
            assert_eq!(buffer.element(i).unwrap(), &(-1i32).to_le_bytes());
        }
    }
}
