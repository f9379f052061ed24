//! Projection of arrays and groups into tables.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use zarr_common::{Result, ZarrError};

use super::column::{Column, ColumnBatch, ColumnBuilder, ColumnData, ColumnField, TableSchema};
use crate::addressing::{self, ChunkSlice};
use crate::cache::{ChunkBuffer, ChunkCache};
use crate::metadata::{ArrayMetadata, MetadataReader, Order};
use crate::types::RowRange;

/// A resolved table: one column per array, all sharing the row dimension.
#[derive(Debug, Clone)]
pub struct TableSource {
    pub table: String,
    pub row_count: u64,
    pub columns: Vec<(String, Arc<ArrayMetadata>)>,
}

impl TableSource {
    pub fn schema(&self) -> TableSchema {
        TableSchema {
            table: self.table.clone(),
            row_count: self.row_count,
            columns: self
                .columns
                .iter()
                .map(|(name, array)| ColumnField::from_array(name, array))
                .collect(),
        }
    }
}

/// Maps tables onto arrays and materializes row ranges as column batches.
pub struct TableProjector {
    metadata: Arc<MetadataReader>,
    cache: Arc<ChunkCache>,
    fetch_concurrency: usize,
}

impl TableProjector {
    pub fn new(metadata: Arc<MetadataReader>, cache: Arc<ChunkCache>, fetch_concurrency: usize) -> Self {
        Self {
            metadata,
            cache,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Resolve `table` to an array, or failing that to a group whose arrays
    /// become the columns.
    #[instrument(skip(self))]
    pub async fn open(&self, table: &str) -> Result<Arc<TableSource>> {
        let path = table.trim_matches('/');

        match self.metadata.read_array_metadata(path).await {
            Ok(array) => {
                array.check_projectable()?;
                return Ok(Arc::new(TableSource {
                    table: path.to_string(),
                    row_count: array.row_count(),
                    columns: vec![(array.name().to_string(), array)],
                }));
            }
            Err(ZarrError::TableNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let group = self.metadata.read_group_metadata(path).await?;
        if let Some((member, err)) = group.invalid.iter().next() {
            warn!(table = path, member = %member, error = %err, "Group member has unusable metadata");
            return Err(err.clone());
        }
        if group.arrays.is_empty() {
            return Err(ZarrError::unsupported_shape(path, "group has no arrays"));
        }

        let mut row_count = None;
        let mut columns = Vec::with_capacity(group.arrays.len());
        for (name, array) in &group.arrays {
            array.check_projectable()?;
            match row_count {
                None => row_count = Some(array.row_count()),
                Some(expected) if expected != array.row_count() => {
                    return Err(ZarrError::malformed(
                        path,
                        format!(
                            "column '{}' has {} rows, expected {}",
                            name,
                            array.row_count(),
                            expected
                        ),
                    ))
                }
                Some(_) => {}
            }
            columns.push((name.clone(), array.clone()));
        }

        Ok(Arc::new(TableSource {
            table: path.to_string(),
            row_count: row_count.unwrap_or(0),
            columns,
        }))
    }

    pub async fn schema(&self, table: &str) -> Result<TableSchema> {
        Ok(self.open(table).await?.schema())
    }

    /// Materialize `range` (clipped to the table) of every column.
    ///
    /// Chunks of all columns share one pool of `fetch_concurrency` fetches.
    /// Returns [`ZarrError::Cancelled`] as soon as `cancel` fires; chunk
    /// fetches already started keep running and still populate the cache.
    pub async fn scan(
        &self,
        source: &TableSource,
        range: RowRange,
        cancel: &CancellationToken,
    ) -> Result<ColumnBatch> {
        if cancel.is_cancelled() {
            return Err(ZarrError::Cancelled);
        }
        let range = range.clip(source.row_count);

        let plans: Vec<Vec<ChunkSlice>> = source
            .columns
            .iter()
            .map(|(_, array)| addressing::resolve(array, range))
            .collect();
        debug!(
            table = %source.table,
            range = %range,
            chunks = plans.iter().map(Vec::len).sum::<usize>(),
            "Scanning table"
        );

        let fetches = stream::iter(source.columns.iter().zip(&plans).flat_map(|((_, array), slices)| {
            slices.iter().map(move |slice| (array, &slice.key))
        }))
        .map(|(array, key)| {
            let cache = self.cache.clone();
            let array = array.clone();
            let key = key.clone();
            async move { cache.get(&array, &key).await }
        })
        .buffered(self.fetch_concurrency)
        .boxed();

        let buffers: Vec<Arc<ChunkBuffer>> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ZarrError::Cancelled),
            fetched = fetches.try_collect::<Vec<_>>() => fetched?,
        };

        let mut remaining = buffers.as_slice();
        let mut columns = Vec::with_capacity(source.columns.len());
        for ((name, array), slices) in source.columns.iter().zip(&plans) {
            let (own, rest) = remaining.split_at(slices.len().min(remaining.len()));
            remaining = rest;
            columns.push(Column {
                name: name.clone(),
                data: materialize(array, range, own)?,
            });
        }
        Ok(ColumnBatch { range, columns })
    }
}

/// Decode the rows of `range` from the chunks resolved for it, in resolve
/// order.
fn materialize(array: &ArrayMetadata, range: RowRange, buffers: &[Arc<ChunkBuffer>]) -> Result<ColumnData> {
    let mut builder = ColumnBuilder::new(array, range.len() as usize);
    if range.is_empty() {
        return Ok(builder.finish());
    }

    let layout = RowLayout::new(array);
    let first_chunk = range.start / layout.chunk_rows;
    for row in range.start..range.end {
        let row_chunk = row / layout.chunk_rows;
        let local_row = row % layout.chunk_rows;
        let base = (row_chunk - first_chunk) as usize * layout.tails;
        for cell in &layout.cells {
            let buffer = buffers.get(base + cell.tail).ok_or_else(|| {
                ZarrError::Internal(format!("no chunk for row {} of {}", row, array.path))
            })?;
            builder.push(buffer.element(layout.element_index(local_row, cell))?)?;
        }
    }
    Ok(builder.finish())
}

/// Position of one trailing element of a row within the chunks of a row.
struct Cell {
    /// Ordinal of the trailing chunk combination holding the element.
    tail: usize,
    /// Offset of the element inside that chunk, before adding the row term.
    offset: u64,
}

/// Where every element of a row lives, in logical C order over the trailing
/// dimensions. The same for every row.
struct RowLayout {
    order: Order,
    chunk_rows: u64,
    tail_volume: u64,
    tails: usize,
    cells: Vec<Cell>,
}

impl RowLayout {
    fn new(array: &ArrayMetadata) -> Self {
        let trailing_shape = &array.shape[1..];
        let trailing_chunks = &array.chunks[1..];
        let trailing_grid: Vec<u64> = array.chunk_grid()[1..].to_vec();
        let width: u64 = trailing_shape.iter().product();

        let cells = (0..width)
            .map(|t| {
                let coords = Order::C.coords(t, trailing_shape);
                let chunk: Vec<u64> = coords.iter().zip(trailing_chunks).map(|(c, n)| c / n).collect();
                let local: Vec<u64> = coords.iter().zip(trailing_chunks).map(|(c, n)| c % n).collect();
                Cell {
                    tail: Order::C.flat_index(&chunk, &trailing_grid) as usize,
                    offset: array.order.flat_index(&local, trailing_chunks),
                }
            })
            .collect();

        Self {
            order: array.order,
            chunk_rows: array.chunk_rows(),
            tail_volume: trailing_chunks.iter().product(),
            tails: trailing_grid.iter().product::<u64>() as usize,
            cells,
        }
    }

    fn element_index(&self, local_row: u64, cell: &Cell) -> usize {
        let index = match self.order {
            Order::C => local_row * self.tail_volume + cell.offset,
            Order::F => local_row + self.chunk_rows * cell.offset,
        };
        index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DataType, Dtype};
    use crate::testdata::{self, ArrayFixture};
    use serde_json::json;
    use std::time::Duration;
    use storage::RetryPolicy;

    async fn projector(fixtures: &[(ArrayFixture, Vec<u8>)]) -> TableProjector {
        let (memory, client) = testdata::memory_client("root.zarr");
        for (fixture, data) in fixtures {
            testdata::write_array(memory.as_ref(), "root.zarr", fixture, data)
                .await
                .unwrap();
        }
        let metadata = Arc::new(MetadataReader::new(client.clone(), Duration::from_secs(60)));
        let cache = Arc::new(ChunkCache::new(client, 1 << 20, RetryPolicy::none()));
        TableProjector::new(metadata, cache, 4)
    }

    fn int32(path: &str, shape: &[u64], chunks: &[u64]) -> ArrayFixture {
        ArrayFixture::new(path, shape, chunks, Dtype::little_endian(DataType::Int32))
    }

    #[tokio::test]
    async fn test_missing_chunk_rows_are_fill() {
        let fixture = int32("temp", &[10], &[4]).skip_chunk(&[2]);
        let projector = projector(&[(fixture, testdata::int32_bytes(&(0..10).collect::<Vec<_>>()))]).await;

        let source = projector.open("temp").await.unwrap();
        let batch = projector
            .scan(&source, RowRange::new(6, 10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.column("temp"), Some(&ColumnData::Int32(vec![6, 7, 0, 0])));
    }

    #[tokio::test]
    async fn test_rank_two_rows_in_c_order() {
        // 5x3 grid split into 2x2 chunks; value = row * 10 + col.
        let values: Vec<i32> = (0..5).flat_map(|r| (0..3).map(move |c| r * 10 + c)).collect();
        for order in [Order::C, Order::F] {
            let fixture = int32("grid", &[5, 3], &[2, 2]).with_order(order);
            let projector = projector(&[(fixture, testdata::int32_bytes(&values))]).await;
            let source = projector.open("grid").await.unwrap();
            let batch = projector
                .scan(&source, RowRange::new(1, 4), &CancellationToken::new())
                .await
                .unwrap();
            let data = batch.column("grid").unwrap();
            assert_eq!(data.len(), 3);
            assert_eq!(data.json_value(0), Some(json!([10, 11, 12])));
            assert_eq!(data.json_value(2), Some(json!([30, 31, 32])));
        }
    }

    #[tokio::test]
    async fn test_group_columns_fetch_together() {
        let (memory, client) = testdata::memory_client("root.zarr");
        testdata::write_group(memory.as_ref(), "root.zarr", "obs").await.unwrap();
        for (name, offset) in [("obs/a", 0), ("obs/b", 100)] {
            let values: Vec<i32> = (offset..offset + 4).collect();
            testdata::write_array(memory.as_ref(), "root.zarr", &int32(name, &[4], &[4]), &testdata::int32_bytes(&values))
                .await
                .unwrap();
        }
        let counting = Arc::new(testdata::CountingClient::new(client).with_delay(Duration::from_millis(50)));
        let metadata = Arc::new(MetadataReader::new(counting.clone(), Duration::from_secs(60)));
        let cache = Arc::new(ChunkCache::new(counting.clone(), 1 << 20, RetryPolicy::none()));
        let projector = TableProjector::new(metadata, cache, 4);

        let source = projector.open("obs").await.unwrap();
        let batch = projector
            .scan(&source, RowRange::new(1, 3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(counting.peak_concurrency(), 2);
        assert_eq!(batch.column("a"), Some(&ColumnData::Int32(vec![1, 2])));
        assert_eq!(batch.column("b"), Some(&ColumnData::Int32(vec![101, 102])));
    }

    #[tokio::test]
    async fn test_group_columns_must_share_rows() {
        let (memory, client) = testdata::memory_client("root.zarr");
        testdata::write_group(memory.as_ref(), "root.zarr", "obs").await.unwrap();
        for (name, rows) in [("obs/a", 4), ("obs/b", 5)] {
            let fixture = int32(name, &[rows], &[2]);
            testdata::write_array(memory.as_ref(), "root.zarr", &fixture, &testdata::int32_bytes(&vec![0; rows as usize]))
                .await
                .unwrap();
        }
        let metadata = Arc::new(MetadataReader::new(client.clone(), Duration::from_secs(60)));
        let cache = Arc::new(ChunkCache::new(client, 1 << 20, RetryPolicy::none()));
        let projector = TableProjector::new(metadata, cache, 4);

        let err = projector.open("obs").await.unwrap_err();
        assert!(matches!(err, ZarrError::MalformedMetadata { .. }));
    }

    #[tokio::test]
    async fn test_zero_trailing_extent_rejected() {
        let projector = projector(&[(int32("empty", &[3, 0], &[3, 1]), Vec::new())]).await;
        let err = projector.open("empty").await.unwrap_err();
        assert!(matches!(err, ZarrError::UnsupportedShape { .. }));
    }

    #[tokio::test]
    async fn test_overflowing_row_width_rejected() {
        let (memory, client) = testdata::memory_client("root.zarr");
        let fixture = int32("big", &[4, 1 << 32, 1 << 32], &[4, 1, 1]);
        testdata::write_metadata(memory.as_ref(), "root.zarr", &fixture)
            .await
            .unwrap();
        let metadata = Arc::new(MetadataReader::new(client.clone(), Duration::from_secs(60)));
        let cache = Arc::new(ChunkCache::new(client, 1 << 20, RetryPolicy::none()));
        let projector = TableProjector::new(metadata, cache, 4);

        let err = projector.open("big").await.unwrap_err();
        assert!(matches!(err, ZarrError::UnsupportedShape { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let projector = projector(&[(int32("temp", &[4], &[2]), testdata::int32_bytes(&[1, 2, 3, 4]))]).await;
        let source = projector.open("temp").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = projector.scan(&source, RowRange::all(), &cancel).await.unwrap_err();
        assert_eq!(err, ZarrError::Cancelled);
    }

    #[tokio::test]
    async fn test_range_past_end_is_empty_batch() {
        let projector = projector(&[(int32("temp", &[4], &[2]), testdata::int32_bytes(&[1, 2, 3, 4]))]).await;
        let source = projector.open("temp").await.unwrap();
        let batch = projector
            .scan(&source, RowRange::new(10, 20), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert!(batch.column("temp").unwrap().is_empty());
    }
}
