//! Byte-bounded LRU cache of decoded chunks with single-flight fetching.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tracing::{debug, warn};

use storage::{retry_with_backoff, ObjectStoreClient, RetryPolicy};
use zarr_common::{Result, ZarrError};

use super::buffer::ChunkBuffer;
use crate::addressing::ChunkKey;
use crate::metadata::ArrayMetadata;
use crate::types::CacheStats;

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<ChunkBuffer>>>>;

const SHARDS: usize = 16;

struct Slot {
    buffer: Arc<ChunkBuffer>,
    tick: u64,
}

impl Slot {
    /// No caller holds the buffer besides the cache.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.buffer) == 1
    }
}

/// LRU index split across independently locked shards.
///
/// The byte budget is shared by all shards. Every insert and hit stamps the
/// entry with a global tick, so eviction picks the least recently used idle
/// entry across shards. Entries a caller still holds are never evicted.
struct Index {
    shards: Vec<Mutex<LruCache<ChunkKey, Slot>>>,
    hasher: RandomState,
    budget: usize,
    used: AtomicUsize,
    clock: AtomicU64,
}

impl Index {
    fn new(budget: usize) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(LruCache::unbounded())).collect(),
            hasher: RandomState::new(),
            budget,
            used: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &ChunkKey) -> MutexGuard<'_, LruCache<ChunkKey, Slot>> {
        let index = (self.hasher.hash_one(key) as usize) % SHARDS;
        lock(&self.shards[index])
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn get(&self, key: &ChunkKey) -> Option<Arc<ChunkBuffer>> {
        let mut shard = self.shard(key);
        let slot = shard.get_mut(key)?;
        slot.tick = self.tick();
        Some(slot.buffer.clone())
    }

    fn contains(&self, key: &ChunkKey) -> bool {
        self.shard(key).contains(key)
    }

    /// Insert `buffer`, evicting idle entries as needed. Returns the number
    /// evicted.
    ///
    /// The buffer is not kept when it is larger than the whole budget, or
    /// when the budget can only be met by evicting entries callers still
    /// hold.
    fn insert(&self, key: ChunkKey, buffer: &Arc<ChunkBuffer>) -> u64 {
        let size = buffer.byte_len();
        if size > self.budget {
            return 0;
        }

        let previous = {
            let mut shard = self.shard(&key);
            let slot = Slot {
                buffer: buffer.clone(),
                tick: self.tick(),
            };
            shard.put(key.clone(), slot)
        };
        if let Some(previous) = previous {
            self.used.fetch_sub(previous.buffer.byte_len(), Ordering::Relaxed);
        }
        self.used.fetch_add(size, Ordering::Relaxed);

        let evicted = self.evict_idle();
        if self.used.load(Ordering::Relaxed) > self.budget {
            let mut shard = self.shard(&key);
            let ours = shard
                .peek(&key)
                .is_some_and(|slot| Arc::ptr_eq(&slot.buffer, buffer));
            if ours && shard.pop(&key).is_some() {
                self.used.fetch_sub(size, Ordering::Relaxed);
            }
        }
        evicted
    }

    /// Drop idle entries, least recently used first, until the budget holds
    /// or nothing idle is left.
    fn evict_idle(&self) -> u64 {
        let mut evicted = 0;
        while self.used.load(Ordering::Relaxed) > self.budget {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    lock(shard)
                        .iter()
                        .rev()
                        .find(|(_, slot)| slot.is_idle())
                        .map(|(key, slot)| (slot.tick, index, key.clone()))
                })
                .min_by_key(|(tick, _, _)| *tick);
            let Some((tick, index, key)) = oldest else {
                break;
            };

            let mut shard = lock(&self.shards[index]);
            let unchanged = shard
                .peek(&key)
                .is_some_and(|slot| slot.tick == tick && slot.is_idle());
            if unchanged {
                if let Some(slot) = shard.pop(&key) {
                    self.used.fetch_sub(slot.buffer.byte_len(), Ordering::Relaxed);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    fn clear(&self) {
        for shard in &self.shards {
            let mut shard = lock(shard);
            let freed: usize = shard.iter().map(|(_, slot)| slot.buffer.byte_len()).sum();
            shard.clear();
            self.used.fetch_sub(freed, Ordering::Relaxed);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    fills: AtomicU64,
    evictions: AtomicU64,
}

/// Shared cache of decoded chunks.
///
/// * At most one fetch per [`ChunkKey`] is in flight; concurrent callers
///   join it and observe the same buffer or the same error.
/// * A chunk missing from the store decodes to the fill value.
/// * Fetches run on their own task, so a caller that goes away does not
///   stop the fetch from completing and populating the cache.
/// * Failures are never cached.
pub struct ChunkCache {
    client: Arc<dyn ObjectStoreClient>,
    retry: RetryPolicy,
    index: Arc<Index>,
    in_flight: Arc<DashMap<ChunkKey, SharedFetch>>,
    counters: Arc<Counters>,
}

impl ChunkCache {
    /// Create a cache holding at most `budget_bytes` of decoded chunks.
    pub fn new(client: Arc<dyn ObjectStoreClient>, budget_bytes: usize, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            index: Arc::new(Index::new(budget_bytes)),
            in_flight: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Decoded chunk `key` of the array described by `metadata`.
    pub async fn get(&self, metadata: &Arc<ArrayMetadata>, key: &ChunkKey) -> Result<Arc<ChunkBuffer>> {
        if let Some(buffer) = self.index.get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buffer);
        }

        let fetch = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(running) => {
                self.counters.joined.fetch_add(1, Ordering::Relaxed);
                running.get().clone()
            }
            Entry::Vacant(slot) => {
                // A fetch may have landed between the lookup and taking the slot.
                if let Some(buffer) = self.index.get(key) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(buffer);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let fetch = self.spawn_fetch(metadata.clone(), key.clone());
                slot.insert(fetch.clone());
                fetch
            }
        };

        fetch.await
    }

    /// Whether `key` is cached, without touching recency.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.index.contains(key)
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            fills: self.counters.fills.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.index.len(),
            memory_bytes: self.memory_usage() as u64,
            budget_bytes: self.index.budget as u64,
        }
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        self.index.clear();
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.index.used.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_fetch(&self, metadata: Arc<ArrayMetadata>, key: ChunkKey) -> SharedFetch {
        let client = self.client.clone();
        let retry = self.retry;
        let index = self.index.clone();
        let in_flight = self.in_flight.clone();
        let counters = self.counters.clone();

        let task = tokio::spawn(async move {
            let result = fetch_chunk(client, &retry, &metadata, key.clone(), &counters)
                .await
                .map(Arc::new);
            if let Ok(buffer) = &result {
                let evicted = index.insert(key.clone(), buffer);
                counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            }
            in_flight.remove(&key);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ZarrError::Internal(format!("chunk fetch task failed: {}", e))))
        }
        .boxed()
        .shared()
    }
}

async fn fetch_chunk(
    client: Arc<dyn ObjectStoreClient>,
    retry: &RetryPolicy,
    metadata: &Arc<ArrayMetadata>,
    key: ChunkKey,
    counters: &Counters,
) -> Result<ChunkBuffer> {
    let object_key = key.object_key(metadata.dimension_separator);
    let fetched = retry_with_backoff(retry, &object_key, || client.get_object(&object_key)).await;

    let encoded = match fetched {
        Ok(encoded) => encoded,
        Err(e) if e.is_not_found() => {
            counters.fills.fetch_add(1, Ordering::Relaxed);
            debug!(key = %object_key, "Chunk absent, using fill value");
            return Ok(ChunkBuffer::filled(
                key,
                metadata.fill_value.as_bytes(),
                metadata.chunk_volume() as usize,
            ));
        }
        Err(e) => {
            warn!(key = %object_key, error = %e, kind = e.kind(), "Chunk fetch failed");
            return Err(e);
        }
    };

    let encoded_len = encoded.len();
    let expected = metadata.chunk_byte_len();
    let decoder = metadata.clone();
    let decoded = tokio::task::spawn_blocking(move || decoder.compressor.decode(&encoded, expected))
        .await
        .map_err(|e| ZarrError::Internal(format!("decode task failed: {}", e)))?
        .map_err(|e| match e {
            ZarrError::Decompression(reason) => {
                ZarrError::Decompression(format!("{}: {}", object_key, reason))
            }
            other => other,
        })?;

    debug!(
        key = %object_key,
        encoded = encoded_len,
        decoded = decoded.len(),
        "Fetched chunk"
    );
    Ok(ChunkBuffer::new(key, metadata.dtype.item_size(), Bytes::from(decoded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compressor;
    use crate::metadata::{DataType, Dtype};
    use crate::testdata::{self, ArrayFixture, CountingClient};
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    /// `temp`: shape [10], chunks [4], int32, fill -1, chunk 2 not written.
    async fn setup(delay: Duration) -> (Arc<CountingClient>, Arc<ArrayMetadata>) {
        let (memory, client) = testdata::memory_client("root.zarr");
        let fixture = ArrayFixture::new("temp", &[10], &[4], Dtype::little_endian(DataType::Int32))
            .with_fill_value(json!(-1))
            .skip_chunk(&[2]);
        let data = testdata::int32_bytes(&(0..10).collect::<Vec<_>>());
        testdata::write_array(memory.as_ref(), "root.zarr", &fixture, &data)
            .await
            .unwrap();
        let counting = Arc::new(CountingClient::new(client).with_delay(delay));
        (counting, Arc::new(fixture.metadata().unwrap()))
    }

    fn key(index: u64) -> ChunkKey {
        ChunkKey::new("temp", vec![index])
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client.clone(), 1024, fast_retry());

        let first = cache.get(&meta, &key(0)).await.unwrap();
        let second = cache.get(&meta, &key(0)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.element(3).unwrap(), &3i32.to_le_bytes());
        assert_eq!(client.gets(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.memory_bytes, 16);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_fill_value() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client, 1024, fast_retry());

        let buffer = cache.get(&meta, &key(2)).await.unwrap();
        assert!(buffer.is_fill());
        assert_eq!(buffer.len(), 4);
        for i in 0..4 {
            assert_eq!(buffer.element(i).unwrap(), &(-1i32).to_le_bytes());
        }
        assert_eq!(cache.stats().fills, 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let (client, meta) = setup(Duration::from_millis(50)).await;
        let cache = Arc::new(ChunkCache::new(client.clone(), 1024, fast_retry()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let meta = meta.clone();
                tokio::spawn(async move { cache.get(&meta, &key(1)).await })
            })
            .collect();

        let mut buffers = Vec::new();
        for handle in handles {
            buffers.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(client.gets(), 1);
        assert!(buffers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.joined, 15);
    }

    #[tokio::test]
    async fn test_budget_respected() {
        let (client, meta) = setup(Duration::ZERO).await;
        // Room for two 16-byte chunks.
        let cache = ChunkCache::new(client, 32, fast_retry());

        for index in 0..3 {
            cache.get(&meta, &key(index)).await.unwrap();
            assert!(cache.memory_usage() <= 32);
        }

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
        assert!(!cache.contains(&key(0)));
    }

    #[tokio::test]
    async fn test_referenced_chunks_evicted_last() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client, 32, fast_retry());

        let pinned = cache.get(&meta, &key(0)).await.unwrap();
        cache.get(&meta, &key(1)).await.unwrap();
        cache.get(&meta, &key(2)).await.unwrap();

        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert_eq!(pinned.element(0).unwrap(), &0i32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_all_entries_held_new_chunk_not_cached() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client.clone(), 32, fast_retry());

        let first = cache.get(&meta, &key(0)).await.unwrap();
        let second = cache.get(&meta, &key(1)).await.unwrap();
        let third = cache.get(&meta, &key(2)).await.unwrap();

        assert!(cache.contains(&key(0)));
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.memory_usage() <= 32);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(first.element(0).unwrap(), &0i32.to_le_bytes());
        assert_eq!(second.element(0).unwrap(), &4i32.to_le_bytes());
        assert!(third.is_fill());

        // Once released, the held entries make room again.
        drop(first);
        cache.get(&meta, &key(2)).await.unwrap();
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(2)));
        assert_eq!(client.gets(), 4);
    }

    #[tokio::test]
    async fn test_lru_order_across_shards() {
        let (memory, client) = testdata::memory_client("root.zarr");
        let fixture = ArrayFixture::new("wide", &[64], &[1], Dtype::little_endian(DataType::Int32));
        let data = testdata::int32_bytes(&(0..64).collect::<Vec<_>>());
        testdata::write_array(memory.as_ref(), "root.zarr", &fixture, &data)
            .await
            .unwrap();
        let meta = Arc::new(fixture.metadata().unwrap());
        // Room for 32 four-byte chunks.
        let cache = ChunkCache::new(client, 128, fast_retry());
        let wide = |index: u64| ChunkKey::new("wide", vec![index]);

        for index in 0..32 {
            cache.get(&meta, &wide(index)).await.unwrap();
        }
        // Touch the older half so the newer half is least recently used.
        for index in 0..16 {
            cache.get(&meta, &wide(index)).await.unwrap();
        }
        for index in 32..48 {
            cache.get(&meta, &wide(index)).await.unwrap();
        }

        assert_eq!(cache.len(), 32);
        assert!((0..16).all(|index| cache.contains(&wide(index))));
        assert!((16..32).all(|index| !cache.contains(&wide(index))));
        assert!((32..48).all(|index| cache.contains(&wide(index))));
    }

    #[tokio::test]
    async fn test_clear_releases_budget() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client, 1024, fast_retry());
        for index in 0..3 {
            cache.get(&meta, &key(index)).await.unwrap();
        }
        assert_eq!(cache.memory_usage(), 48);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
    }

    #[tokio::test]
    async fn test_oversized_chunk_not_cached() {
        let (client, meta) = setup(Duration::ZERO).await;
        let cache = ChunkCache::new(client.clone(), 8, fast_retry());

        let buffer = cache.get(&meta, &key(0)).await.unwrap();
        assert_eq!(buffer.len(), 4);
        assert!(cache.is_empty());

        cache.get(&meta, &key(0)).await.unwrap();
        assert_eq!(client.gets(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let (client, meta) = setup(Duration::ZERO).await;
        let client = Arc::new(CountingClient::new(client).failing_first(2));
        let cache = ChunkCache::new(client.clone(), 1024, fast_retry());

        let buffer = cache.get(&meta, &key(1)).await.unwrap();
        assert_eq!(buffer.element(0).unwrap(), &4i32.to_le_bytes());
        assert_eq!(client.gets(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_not_cached() {
        let (client, meta) = setup(Duration::ZERO).await;
        let client = Arc::new(CountingClient::new(client).failing_first(3));
        let cache = ChunkCache::new(client.clone(), 1024, fast_retry());

        let err = cache.get(&meta, &key(1)).await.unwrap_err();
        assert!(matches!(err, ZarrError::EndpointUnreachable { attempts: 3, .. }));
        assert!(!cache.contains(&key(1)));

        // The failure is not remembered.
        assert!(cache.get(&meta, &key(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_populates_cache() {
        let (client, meta) = setup(Duration::from_millis(50)).await;
        let cache = Arc::new(ChunkCache::new(client.clone(), 1024, fast_retry()));

        let caller = {
            let cache = cache.clone();
            let meta = meta.clone();
            tokio::spawn(async move { cache.get(&meta, &key(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.contains(&key(0)));
        assert_eq!(client.gets(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_decompression_error() {
        let (memory, client) = testdata::memory_client("root.zarr");
        let fixture = ArrayFixture::new("z", &[4], &[4], Dtype::little_endian(DataType::Int32))
            .with_compressor(Compressor::Zlib { level: 1 });
        testdata::write_metadata(memory.as_ref(), "root.zarr", &fixture)
            .await
            .unwrap();
        testdata::put(memory.as_ref(), "root.zarr/z/0", b"not zlib".to_vec())
            .await
            .unwrap();

        let cache = ChunkCache::new(client, 1024, fast_retry());
        let meta = Arc::new(fixture.metadata().unwrap());
        let err = cache.get(&meta, &ChunkKey::new("z", vec![0])).await.unwrap_err();
        assert!(matches!(err, ZarrError::Decompression(_)));
    }
}
