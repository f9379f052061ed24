//! Zarr v2 arrays in object stores, exposed as queryable tables.
//!
//! This crate turns a hierarchy of chunked Zarr arrays stored in an
//! S3-compatible bucket into tables a query engine can list, describe and
//! scan. It provides:
//!
//! - **Metadata resolution**: `.zarray`, `.zgroup`, `.zattrs` and
//!   consolidated `.zmetadata` documents, cached for a TTL
//! - **Chunk addressing**: row ranges mapped to chunk keys with plain
//!   arithmetic
//! - **Chunk caching**: a byte-bounded LRU of decoded chunks with one fetch
//!   per chunk in flight, fill values for chunks never written
//! - **Projection**: one array (or the arrays of a group) as typed column
//!   batches
//!
//! # Architecture
//!
//! ```text
//! Connector::open_scan(table, predicate)
//!      │
//!      ├─► TableProjector::open ─► MetadataReader (array, else group)
//!      │
//!      ├─► predicate ─► RowRange ─► batches of batch_rows
//!      │
//!      └─► per batch, per column:
//!               │
//!               ├─► addressing::resolve(range) ─► ChunkKeys
//!               │
//!               ├─► ChunkCache::get(key)
//!               │         │
//!               │         ├─► hit: shared decoded buffer
//!               │         ├─► in flight: join the running fetch
//!               │         └─► miss: GET + retry + decompress (or fill)
//!               │
//!               └─► decode elements into ColumnData
//! ```
//!
//! # Example
//!
//! ```ignore
//! use zarr_processor::{Connector, Predicate, ProcessorConfig, RowRange, ZarrConnector};
//!
//! let connector = ZarrConnector::from_store_config(&store_config, ProcessorConfig::default())?;
//! for table in connector.list_tables().await? {
//!     println!("{}", connector.get_schema(&table).await?.row_count);
//! }
//!
//! let predicate = Predicate::RowRange(RowRange::new(50, 60));
//! let mut batches = connector.open_scan("obs", &predicate, CancellationToken::new()).await?;
//! while let Some(batch) = batches.next().await {
//!     let batch = batch?;
//!     // ...
//! }
//! ```

pub mod addressing;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connector;
pub mod metadata;
pub mod table;
pub mod testdata;
pub mod types;

// Re-export commonly used types at crate root
pub use addressing::{ChunkKey, ChunkSlice};
pub use cache::{ChunkBuffer, ChunkCache};
pub use codec::{BloscCname, Compressor, Shuffle};
pub use config::ProcessorConfig;
pub use connector::{Connector, Predicate, ScanStream, ZarrConnector, DEFAULT_SCHEMA};
pub use metadata::{ArrayMetadata, DataType, Dtype, FillValue, GroupMetadata, MetadataReader, Order};
pub use table::{Column, ColumnBatch, ColumnData, ColumnField, ColumnType, TableProjector, TableSchema};
pub use types::{CacheStats, RowRange};
pub use zarr_common::{Result, ZarrError};
