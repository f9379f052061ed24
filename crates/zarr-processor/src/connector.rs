//! Query-engine facade: table listing, schemas and batched scans.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use storage::{AccessGrant, GrantStore, ObjectStoreClient, RemoteObjectStore, StoreConfig};
use zarr_common::{Result, ZarrError};

use crate::addressing;
use crate::cache::ChunkCache;
use crate::config::ProcessorConfig;
use crate::metadata::MetadataReader;
use crate::table::{ColumnBatch, TableProjector, TableSchema};
use crate::types::{CacheStats, RowRange};

/// The only schema the connector exposes.
pub const DEFAULT_SCHEMA: &str = "default";

/// Filter handed down by the host engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    RowRange(RowRange),
    And(Vec<Predicate>),
    /// Anything the core cannot push down; evaluated by the host.
    Opaque(String),
}

impl Predicate {
    /// The row range this predicate restricts a scan to.
    pub fn row_range(&self) -> RowRange {
        match self {
            Predicate::All | Predicate::Opaque(_) => RowRange::all(),
            Predicate::RowRange(range) => *range,
            Predicate::And(parts) => parts
                .iter()
                .fold(RowRange::all(), |acc, p| acc.intersect(&p.row_range())),
        }
    }
}

/// Ordered batches of one scan.
pub type ScanStream = BoxStream<'static, Result<ColumnBatch>>;

/// Operations a host query engine calls.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Schema names. Tables of every schema are the same.
    fn list_schema_names(&self) -> Vec<String>;

    /// Names of all tables below the root group.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns and row count of `table`.
    async fn get_schema(&self, table: &str) -> Result<TableSchema>;

    /// Scan the rows of `table` selected by `predicate`.
    ///
    /// Schema errors are returned before the first batch. The stream yields
    /// batches in ascending row order and reports
    /// [`ZarrError::Cancelled`] once `cancel` fires.
    async fn open_scan(
        &self,
        table: &str,
        predicate: &Predicate,
        cancel: CancellationToken,
    ) -> Result<ScanStream>;

    /// Hint that `range` of `table` will be scanned soon.
    ///
    /// Failures are logged and otherwise ignored.
    async fn prefetch(&self, table: &str, range: RowRange);

    /// Get cache statistics for monitoring.
    fn cache_stats(&self) -> CacheStats;
}

/// [`Connector`] over Zarr v2 hierarchies in an object store.
pub struct ZarrConnector {
    metadata: Arc<MetadataReader>,
    cache: Arc<ChunkCache>,
    projector: Arc<TableProjector>,
    grants: GrantStore,
    config: ProcessorConfig,
}

impl ZarrConnector {
    /// Create a connector over an existing client.
    pub fn new(client: Arc<dyn ObjectStoreClient>, config: ProcessorConfig) -> Result<Self> {
        config.validate().map_err(ZarrError::Configuration)?;

        let metadata = Arc::new(MetadataReader::new(client.clone(), config.metadata_ttl()));
        let cache = Arc::new(ChunkCache::new(
            client.clone(),
            config.chunk_cache_size_bytes(),
            config.retry_policy(),
        ));
        let projector = Arc::new(TableProjector::new(
            metadata.clone(),
            cache.clone(),
            config.fetch_concurrency,
        ));
        let grants = GrantStore::new(client, config.grant_ttl(), config.grant_refresh_margin());

        info!(
            cache_mb = config.chunk_cache_size_mb,
            fetch_concurrency = config.fetch_concurrency,
            batch_rows = config.batch_rows,
            "Created zarr connector"
        );

        Ok(Self {
            metadata,
            cache,
            projector,
            grants,
            config,
        })
    }

    /// Resolve the store from configuration and create a connector.
    ///
    /// Configuration errors are reported before any request is made.
    pub fn from_store_config(store: &StoreConfig, config: ProcessorConfig) -> Result<Self> {
        let client = RemoteObjectStore::new(store)?;
        Self::new(Arc::new(client), config)
    }

    /// A valid access grant for `key`, relative to the root group.
    pub async fn access_grant(&self, key: &str) -> Result<AccessGrant> {
        self.grants.grant(key).await
    }

    /// Forget cached metadata so the next lookup re-reads the store.
    pub fn invalidate_metadata(&self) {
        self.metadata.invalidate();
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for ZarrConnector {
    fn list_schema_names(&self) -> Vec<String> {
        vec![DEFAULT_SCHEMA.to_string()]
    }

    #[instrument(skip(self))]
    async fn list_tables(&self) -> Result<Vec<String>> {
        let root = self.metadata.read_group_metadata("").await?;

        let mut tables = Vec::new();
        for (name, array) in &root.arrays {
            match array.check_projectable() {
                Ok(()) => tables.push(name.clone()),
                Err(e) => warn!(table = %name, error = %e, "Skipping array"),
            }
        }
        for (name, err) in &root.invalid {
            warn!(table = %name, error = %err, kind = err.kind(), "Skipping array with unusable metadata");
        }
        for name in &root.groups {
            match self.projector.open(name).await {
                Ok(_) => tables.push(name.clone()),
                Err(e) if e.is_schema_error() => {
                    warn!(table = %name, error = %e, "Skipping group")
                }
                Err(e) => return Err(e),
            }
        }

        tables.sort();
        debug!(count = tables.len(), "Listed tables");
        Ok(tables)
    }

    async fn get_schema(&self, table: &str) -> Result<TableSchema> {
        self.projector.schema(table).await
    }

    #[instrument(skip(self, cancel))]
    async fn open_scan(
        &self,
        table: &str,
        predicate: &Predicate,
        cancel: CancellationToken,
    ) -> Result<ScanStream> {
        let source = self.projector.open(table).await?;
        let range = predicate.row_range().clip(source.row_count);
        let batches = range.batches(self.config.batch_rows);

        info!(
            table = %source.table,
            range = %range,
            batches = batches.len(),
            "Opening scan"
        );

        let projector = self.projector.clone();
        let stream = stream::iter(batches).then(move |batch| {
            let projector = projector.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            async move { projector.scan(&source, batch, &cancel).await }
        });
        Ok(stream.boxed())
    }

    async fn prefetch(&self, table: &str, range: RowRange) {
        let source = match self.projector.open(table).await {
            Ok(source) => source,
            Err(e) => {
                warn!(table, error = %e, "Prefetch skipped");
                return;
            }
        };

        let slices = source.columns.iter().flat_map(|(_, array)| {
            addressing::resolve(array, range)
                .into_iter()
                .map(move |slice| (array.clone(), slice.key))
        });
        // Each buffer is released as soon as it lands.
        let failed = stream::iter(slices)
            .map(|(array, key)| {
                let cache = self.cache.clone();
                async move { cache.get(&array, &key).await }
            })
            .buffer_unordered(self.config.fetch_concurrency)
            .boxed()
            .fold(0usize, |failed, result| async move { failed + usize::from(result.is_err()) })
            .await;
        if failed > 0 {
            warn!(table, failed, "Some prefetched chunks failed");
        }
    }

    fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_ranges_intersect() {
        let predicate = Predicate::And(vec![
            Predicate::RowRange(RowRange::new(10, 100)),
            Predicate::Opaque("name = 'x'".to_string()),
            Predicate::RowRange(RowRange::new(50, 200)),
        ]);
        assert_eq!(predicate.row_range(), RowRange::new(50, 100));
        assert_eq!(Predicate::All.row_range(), RowRange::all());
    }

    #[test]
    fn test_disjoint_ranges_are_empty() {
        let predicate = Predicate::And(vec![
            Predicate::RowRange(RowRange::new(0, 10)),
            Predicate::RowRange(RowRange::new(20, 30)),
        ]);
        assert!(predicate.row_range().is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_bounded_by_fetch_concurrency() {
        use crate::metadata::{DataType, Dtype};
        use crate::testdata::{self, ArrayFixture, CountingClient};
        use std::time::Duration;

        let (memory, client) = testdata::memory_client("root.zarr");
        let fixture = ArrayFixture::new("temp", &[32], &[4], Dtype::little_endian(DataType::Int32));
        let data = testdata::int32_bytes(&(0..32).collect::<Vec<_>>());
        testdata::write_array(memory.as_ref(), "root.zarr", &fixture, &data)
            .await
            .unwrap();
        let counting = Arc::new(CountingClient::new(client).with_delay(Duration::from_millis(20)));
        let config = ProcessorConfig {
            fetch_concurrency: 2,
            ..Default::default()
        };
        let connector = ZarrConnector::new(counting.clone(), config).unwrap();

        connector.prefetch("temp", RowRange::all()).await;

        assert_eq!(counting.gets(), 8);
        assert_eq!(counting.peak_concurrency(), 2);
        assert_eq!(connector.cache_stats().entries, 8);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_memory, client) = crate::testdata::memory_client("root.zarr");
        let config = ProcessorConfig {
            batch_rows: 0,
            ..Default::default()
        };
        assert!(matches!(
            ZarrConnector::new(client, config),
            Err(ZarrError::Configuration(_))
        ));
    }
}
