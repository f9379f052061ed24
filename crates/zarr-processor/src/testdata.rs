//! Test data generation utilities.
//!
//! Builds small Zarr v2 hierarchies in an in-memory object store so that unit
//! and integration tests can exercise the full read path without a network.
//!
//! Arrays are described with [`ArrayFixture`] and written from logical data
//! laid out in C order over the array shape. Chunks are padded with the fill
//! value, stored in the fixture's element order and compressed with its
//! compressor, exactly as a Zarr writer would.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde_json::{json, Map, Value};

use storage::{
    AccessGrant, Listing, ObjectInfo, ObjectStoreClient, RemoteObjectStore, StoreEndpoint,
    StoreLocation,
};
use zarr_common::{Result, ZarrError};

use crate::addressing::ChunkKey;
use crate::codec::Compressor;
use crate::metadata::{join_path, ArrayMetadata, Dtype, Order};

/// An in-memory store plus a client rooted at `prefix` inside it.
pub fn memory_client(prefix: &str) -> (Arc<InMemory>, Arc<dyn ObjectStoreClient>) {
    let memory = Arc::new(InMemory::new());
    let endpoint = StoreEndpoint::custom("http://localhost:9000", None)
        .expect("static endpoint is valid");
    let location =
        StoreLocation::new("bucket", prefix, endpoint).expect("static location is valid");
    let client = RemoteObjectStore::with_store(memory.clone(), location);
    (memory, Arc::new(client))
}

/// Description of an array to write.
#[derive(Debug, Clone)]
pub struct ArrayFixture {
    pub path: String,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: Dtype,
    pub compressor: Compressor,
    pub fill_value: Value,
    pub order: Order,
    pub separator: char,
    pub attributes: Map<String, Value>,
    skipped: HashSet<Vec<u64>>,
}

impl ArrayFixture {
    pub fn new(path: &str, shape: &[u64], chunks: &[u64], dtype: Dtype) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            shape: shape.to_vec(),
            chunks: chunks.to_vec(),
            dtype,
            compressor: Compressor::None,
            fill_value: Value::Null,
            order: Order::C,
            separator: '.',
            attributes: Map::new(),
            skipped: HashSet::new(),
        }
    }

    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_fill_value(mut self, fill_value: Value) -> Self {
        self.fill_value = fill_value;
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Attach `.zattrs`. Non-object values are ignored.
    pub fn with_attributes(mut self, attributes: Value) -> Self {
        if let Value::Object(map) = attributes {
            self.attributes = map;
        }
        self
    }

    /// Leave the chunk at `indices` unwritten.
    pub fn skip_chunk(mut self, indices: &[u64]) -> Self {
        self.skipped.insert(indices.to_vec());
        self
    }

    /// The `.zarray` document for this fixture.
    pub fn document(&self) -> Value {
        json!({
            "zarr_format": 2,
            "shape": self.shape,
            "chunks": self.chunks,
            "dtype": self.dtype.to_zarr_string(),
            "compressor": self.compressor.to_json(),
            "fill_value": self.fill_value,
            "order": self.order.as_str(),
            "filters": Value::Null,
            "dimension_separator": self.separator.to_string(),
        })
    }

    /// Parsed metadata, as the reader would produce it.
    pub fn metadata(&self) -> Result<ArrayMetadata> {
        let meta = ArrayMetadata::from_value(&self.path, &self.document())?;
        Ok(meta.with_attributes(self.attributes.clone()))
    }
}

/// Store one object at an absolute key.
pub async fn put(store: &dyn ObjectStore, key: &str, bytes: Vec<u8>) -> Result<()> {
    store
        .put(&Path::from(key), Bytes::from(bytes).into())
        .await
        .map_err(|e| ZarrError::Internal(format!("test store put '{}': {}", key, e)))?;
    Ok(())
}

async fn put_json(store: &dyn ObjectStore, key: &str, value: &Value) -> Result<()> {
    put(store, key, serde_json::to_vec(value)?).await
}

/// Write `.zarray` (and `.zattrs` when present) without any chunks.
pub async fn write_metadata(store: &dyn ObjectStore, prefix: &str, fixture: &ArrayFixture) -> Result<()> {
    let base = join_path(prefix, &fixture.path);
    put_json(store, &join_path(&base, ".zarray"), &fixture.document()).await?;
    if !fixture.attributes.is_empty() {
        put_json(
            store,
            &join_path(&base, ".zattrs"),
            &Value::Object(fixture.attributes.clone()),
        )
        .await?;
    }
    Ok(())
}

/// Write a `.zgroup` document for the group at `path`.
pub async fn write_group(store: &dyn ObjectStore, prefix: &str, path: &str) -> Result<()> {
    let key = join_path(&join_path(prefix, path), ".zgroup");
    put_json(store, &key, &json!({"zarr_format": 2})).await
}

/// Write metadata and every chunk of `fixture`.
///
/// `data` holds the whole array in C order over its shape.
pub async fn write_array(
    store: &dyn ObjectStore,
    prefix: &str,
    fixture: &ArrayFixture,
    data: &[u8],
) -> Result<()> {
    let meta = fixture.metadata()?;
    let item = meta.dtype.item_size();
    let total: u64 = meta.shape.iter().product();
    if data.len() != total as usize * item {
        return Err(ZarrError::Internal(format!(
            "fixture '{}' expects {} bytes, got {}",
            fixture.path,
            total as usize * item,
            data.len()
        )));
    }

    write_metadata(store, prefix, fixture).await?;

    let grid = meta.chunk_grid();
    let chunk_count: u64 = grid.iter().product();
    for flat in 0..chunk_count {
        let indices = Order::C.coords(flat, &grid);
        if fixture.skipped.contains(&indices) {
            continue;
        }

        let mut raw = meta.fill_value.as_bytes().repeat(meta.chunk_volume() as usize);
        for local in 0..meta.chunk_volume() {
            let coords = meta.order.coords(local, &meta.chunks);
            let global: Vec<u64> = coords
                .iter()
                .zip(&indices)
                .zip(&meta.chunks)
                .map(|((c, i), n)| i * n + c)
                .collect();
            if global.iter().zip(&meta.shape).any(|(g, s)| g >= s) {
                continue;
            }
            let src = Order::C.flat_index(&global, &meta.shape) as usize * item;
            let dst = local as usize * item;
            raw[dst..dst + item].copy_from_slice(&data[src..src + item]);
        }

        let encoded = meta.compressor.encode(&raw, item)?;
        let key = ChunkKey::new(meta.path.as_str(), indices).object_key(meta.dimension_separator);
        put(store, &join_path(prefix, &key), encoded).await?;
    }
    Ok(())
}

/// Write a consolidated `.zmetadata` for the group at `group_path`.
///
/// Array fixture paths are relative to the store root and must lie directly
/// below the group; `groups` are child group names.
pub async fn write_consolidated(
    store: &dyn ObjectStore,
    prefix: &str,
    group_path: &str,
    arrays: &[&ArrayFixture],
    groups: &[&str],
) -> Result<()> {
    let group_path = group_path.trim_matches('/');
    let mut entries = Map::new();
    entries.insert(".zgroup".to_string(), json!({"zarr_format": 2}));

    for fixture in arrays {
        let relative = fixture
            .path
            .strip_prefix(group_path)
            .unwrap_or(&fixture.path)
            .trim_start_matches('/');
        entries.insert(format!("{}/.zarray", relative), fixture.document());
        if !fixture.attributes.is_empty() {
            entries.insert(
                format!("{}/.zattrs", relative),
                Value::Object(fixture.attributes.clone()),
            );
        }
    }
    for group in groups {
        entries.insert(format!("{}/.zgroup", group), json!({"zarr_format": 2}));
    }

    let doc = json!({
        "zarr_consolidated_format": 1,
        "metadata": entries,
    });
    let key = join_path(&join_path(prefix, group_path), ".zmetadata");
    put_json(store, &key, &doc).await
}

/// Little-endian bytes of `values`.
pub fn int32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Little-endian bytes of `values`.
pub fn float64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Client wrapper that counts whole-object reads and can inject latency or
/// transient failures.
#[derive(Debug)]
pub struct CountingClient {
    inner: Arc<dyn ObjectStoreClient>,
    gets: AtomicUsize,
    failures_left: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl CountingClient {
    pub fn new(inner: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long before every read.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` whole-object reads with a transient error.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Whole-object reads issued so far, failed ones included.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Most whole-object reads that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl CountingClient {
    async fn read(&self, key: &str) -> Result<Bytes> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ZarrError::TransientNetwork(format!("injected failure for {}", key)));
        }
        self.inner.get_object(key).await
    }
}

#[async_trait]
impl ObjectStoreClient for CountingClient {
    async fn head_object(&self, key: &str) -> Result<ObjectInfo> {
        self.inner.head_object(key).await
    }

    async fn get_range(&self, key: &str, start: u64, end_inclusive: u64) -> Result<Bytes> {
        self.inner.get_range(key, start, end_inclusive).await
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let result = self.read(key).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_children(&self, prefix: &str) -> Result<Listing> {
        self.inner.list_children(prefix).await
    }

    async fn sign(&self, key: &str, ttl: Duration) -> Result<AccessGrant> {
        self.inner.sign(key, ttl).await
    }
}
