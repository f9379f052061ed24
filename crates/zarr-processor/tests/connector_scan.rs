//! End-to-end tests of the connector over an in-memory object store.
//!
//! Every test writes a small Zarr hierarchy with `zarr_processor::testdata`
//! and drives it through the `Connector` operations a query engine uses.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use object_store::memory::InMemory;
use serde_json::json;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use storage::ObjectStoreClient;
use zarr_processor::testdata::{self, ArrayFixture, CountingClient};
use zarr_processor::{
    BloscCname, ColumnBatch, ColumnData, ColumnType, Compressor, Connector, DataType, Dtype, Order,
    Predicate, ProcessorConfig, RowRange, Shuffle, ZarrConnector, ZarrError,
};

const PREFIX: &str = "datasets/root.zarr";

fn config() -> ProcessorConfig {
    ProcessorConfig {
        chunk_cache_size_mb: 4,
        fetch_concurrency: 4,
        max_retries: 1,
        initial_retry_delay_ms: 1,
        max_retry_delay_ms: 2,
        ..Default::default()
    }
}

fn connector(client: Arc<dyn ObjectStoreClient>, config: ProcessorConfig) -> ZarrConnector {
    ZarrConnector::new(client, config).expect("valid config")
}

async fn collect(connector: &ZarrConnector, table: &str, predicate: Predicate) -> Vec<ColumnBatch> {
    let stream = connector
        .open_scan(table, &predicate, CancellationToken::new())
        .await
        .expect("scan opens");
    stream
        .map(|batch| batch.expect("batch succeeds"))
        .collect()
        .await
}

fn int32(path: &str, shape: &[u64], chunks: &[u64]) -> ArrayFixture {
    ArrayFixture::new(path, shape, chunks, Dtype::little_endian(DataType::Int32))
}

/// Root group with `temp` (10 rows, chunks of 4, chunk 2 missing) and group
/// `obs` holding `lat` (f8) and `count` (i4), 100 rows each.
async fn write_hierarchy(memory: &InMemory) {
    testdata::write_group(memory, PREFIX, "").await.unwrap();

    let temp = int32("temp", &[10], &[4])
        .skip_chunk(&[2])
        .with_attributes(json!({"units": "K"}));
    testdata::write_array(memory, PREFIX, &temp, &testdata::int32_bytes(&(0..10).collect::<Vec<_>>()))
        .await
        .unwrap();

    testdata::write_group(memory, PREFIX, "obs").await.unwrap();
    let lat = ArrayFixture::new("obs/lat", &[100], &[16], Dtype::little_endian(DataType::Float64))
        .with_compressor(Compressor::Zstd { level: 3 });
    let lats: Vec<f64> = (0..100).map(|i| i as f64 * 0.5).collect();
    testdata::write_array(memory, PREFIX, &lat, &testdata::float64_bytes(&lats))
        .await
        .unwrap();

    let count = int32("obs/count", &[100], &[32]).with_compressor(Compressor::Blosc {
        cname: BloscCname::Lz4,
        clevel: 5,
        shuffle: Shuffle::Byte,
        blocksize: 0,
    });
    let counts: Vec<i32> = (0..100).map(|i| i * 3).collect();
    testdata::write_array(memory, PREFIX, &count, &testdata::int32_bytes(&counts))
        .await
        .unwrap();
}

// =============================================================================
// Discovery and schemas
// =============================================================================

#[tokio::test]
async fn test_list_tables_and_schemas() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    assert_eq!(connector.list_schema_names(), vec!["default".to_string()]);
    assert_eq!(assert_ok!(connector.list_tables().await), vec!["obs", "temp"]);

    let temp = connector.get_schema("temp").await.unwrap();
    assert_eq!(temp.row_count, 10);
    assert_eq!(temp.columns.len(), 1);
    assert_eq!(temp.columns[0].column_type, ColumnType::Int32);
    assert_eq!(temp.columns[0].attributes["units"], json!("K"));

    let obs = connector.get_schema("obs").await.unwrap();
    assert_eq!(obs.row_count, 100);
    let names: Vec<&str> = obs.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["count", "lat"]);
    assert_eq!(obs.column("lat").unwrap().column_type, ColumnType::Float64);
}

#[tokio::test]
async fn test_unknown_table() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    let err = connector.get_schema("missing").await.unwrap_err();
    assert_eq!(err, ZarrError::TableNotFound("missing".to_string()));

    let err = connector
        .open_scan("missing", &Predicate::All, CancellationToken::new())
        .await
        .err()
        .expect("scan of a missing table fails");
    assert!(err.is_schema_error());
}

#[tokio::test]
async fn test_malformed_array_isolated() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    testdata::put(
        memory.as_ref(),
        &format!("{}/broken/.zarray", PREFIX),
        br#"{"zarr_format": 2, "shape": [4], "chunks": [2, 2], "dtype": "<i4"}"#.to_vec(),
    )
    .await
    .unwrap();
    let connector = connector(client, config());

    assert_eq!(connector.list_tables().await.unwrap(), vec!["obs", "temp"]);
    let err = connector.get_schema("broken").await.unwrap_err();
    assert!(matches!(err, ZarrError::MalformedMetadata { .. }));

    // Siblings still scan.
    let batches = collect(&connector, "temp", Predicate::All).await;
    assert_eq!(batches.len(), 1);
}

#[tokio::test]
async fn test_unsupported_compressor_reported_at_schema_time() {
    let (memory, client) = testdata::memory_client(PREFIX);
    testdata::put(
        memory.as_ref(),
        &format!("{}/packed/.zarray", PREFIX),
        serde_json::to_vec(&json!({
            "zarr_format": 2,
            "shape": [8],
            "chunks": [4],
            "dtype": "<f4",
            "compressor": {"id": "lzma", "preset": 6},
            "fill_value": null,
            "order": "C",
            "filters": null
        }))
        .unwrap(),
    )
    .await
    .unwrap();
    let connector = connector(client, config());

    let err = connector.get_schema("packed").await.unwrap_err();
    assert_eq!(err, ZarrError::UnsupportedCompressor("lzma".to_string()));
}

// =============================================================================
// Scans
// =============================================================================

#[tokio::test]
async fn test_missing_chunk_reads_as_fill_value() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    let batches = collect(&connector, "temp", Predicate::RowRange(RowRange::new(8, 10))).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].range, RowRange::new(8, 10));
    assert_eq!(batches[0].column("temp"), Some(&ColumnData::Int32(vec![0, 0])));
    assert_eq!(connector.cache_stats().fills, 1);
}

#[tokio::test]
async fn test_group_scan_across_chunk_boundaries() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    let batches = collect(&connector, "obs", Predicate::RowRange(RowRange::new(50, 60))).await;
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.num_rows(), 10);

    let expected_lat: Vec<f64> = (50..60).map(|i| i as f64 * 0.5).collect();
    let expected_count: Vec<i32> = (50..60).map(|i| i * 3).collect();
    assert_eq!(batch.column("lat"), Some(&ColumnData::Float64(expected_lat)));
    assert_eq!(batch.column("count"), Some(&ColumnData::Int32(expected_count)));
}

#[tokio::test]
async fn test_batches_follow_batch_rows() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(
        client,
        ProcessorConfig {
            batch_rows: 4,
            ..config()
        },
    );

    let batches = collect(&connector, "temp", Predicate::All).await;
    let ranges: Vec<RowRange> = batches.iter().map(|b| b.range).collect();
    assert_eq!(
        ranges,
        vec![RowRange::new(0, 4), RowRange::new(4, 8), RowRange::new(8, 10)]
    );

    let values: Vec<i32> = batches
        .iter()
        .flat_map(|b| match b.column("temp") {
            Some(ColumnData::Int32(v)) => v.clone(),
            other => panic!("unexpected column {:?}", other),
        })
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 0]);
}

#[tokio::test]
async fn test_predicates_pushed_down() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    let predicate = Predicate::And(vec![
        Predicate::RowRange(RowRange::new(2, 9)),
        Predicate::Opaque("temp > 3".to_string()),
        Predicate::RowRange(RowRange::new(0, 5)),
    ]);
    let batches = collect(&connector, "temp", predicate).await;
    assert_eq!(batches[0].column("temp"), Some(&ColumnData::Int32(vec![2, 3, 4])));

    let outside = collect(&connector, "temp", Predicate::RowRange(RowRange::new(20, 30))).await;
    assert!(outside.is_empty());
}

#[tokio::test]
async fn test_codecs_and_layouts() {
    let (memory, client) = testdata::memory_client(PREFIX);
    let values: Vec<f64> = (0..40).map(|i| (i as f64).sqrt()).collect();
    let compressors = [
        ("raw", Compressor::None),
        ("zlib", Compressor::Zlib { level: 6 }),
        ("gzip", Compressor::Gzip { level: 6 }),
        ("lz4", Compressor::Lz4 { acceleration: 1 }),
        (
            "blosc_zstd",
            Compressor::Blosc {
                cname: BloscCname::Zstd,
                clevel: 5,
                shuffle: Shuffle::Bit,
                blocksize: 0,
            },
        ),
        (
            "blosc_zlib",
            Compressor::Blosc {
                cname: BloscCname::Zlib,
                clevel: 5,
                shuffle: Shuffle::Byte,
                blocksize: 0,
            },
        ),
    ];
    for (name, compressor) in &compressors {
        let fixture = ArrayFixture::new(name, &[40], &[16], Dtype::little_endian(DataType::Float64))
            .with_compressor(compressor.clone())
            .with_separator('/');
        testdata::write_array(memory.as_ref(), PREFIX, &fixture, &testdata::float64_bytes(&values))
            .await
            .unwrap();
    }
    let connector = connector(client, config());

    for (name, _) in &compressors {
        let batches = collect(&connector, name, Predicate::RowRange(RowRange::new(10, 35))).await;
        assert_eq!(
            batches[0].column(name),
            Some(&ColumnData::Float64(values[10..35].to_vec())),
            "compressor {}",
            name
        );
    }
}

#[tokio::test]
async fn test_rank_three_array_as_list_column() {
    let (memory, client) = testdata::memory_client(PREFIX);
    // value = t * 100 + y * 10 + x over shape [6, 3, 4], Fortran-ordered chunks.
    let values: Vec<i32> = (0..6)
        .flat_map(|t| (0..3).flat_map(move |y| (0..4).map(move |x| t * 100 + y * 10 + x)))
        .collect();
    let fixture = int32("cube", &[6, 3, 4], &[4, 2, 3]).with_order(Order::F);
    testdata::write_array(memory.as_ref(), PREFIX, &fixture, &testdata::int32_bytes(&values))
        .await
        .unwrap();
    let connector = connector(client, config());

    let schema = connector.get_schema("cube").await.unwrap();
    assert_eq!(
        schema.columns[0].column_type,
        ColumnType::FixedSizeList {
            element: Box::new(ColumnType::Int32),
            length: 12
        }
    );

    let batches = collect(&connector, "cube", Predicate::RowRange(RowRange::new(3, 5))).await;
    let data = batches[0].column("cube").unwrap();
    assert_eq!(data.len(), 2);
    let expected: Vec<i32> = values[3 * 12..5 * 12].to_vec();
    assert_eq!(
        data,
        &ColumnData::FixedSizeList {
            length: 12,
            values: Box::new(ColumnData::Int32(expected)),
        }
    );
}

// =============================================================================
// Cancellation, caching and grants
// =============================================================================

#[tokio::test]
async fn test_cancelled_scan_stops_promptly() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let slow = Arc::new(CountingClient::new(client).with_delay(Duration::from_millis(500)));
    let connector = connector(slow, config());

    // Resolve metadata first so only chunk reads are slow to matter.
    connector.get_schema("temp").await.unwrap();

    let cancel = CancellationToken::new();
    let mut stream = connector
        .open_scan("temp", &Predicate::All, cancel.clone())
        .await
        .unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let first = stream.next().await.expect("one result");
    assert_eq!(first.unwrap_err(), ZarrError::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_repeated_scans_served_from_cache() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let counting = Arc::new(CountingClient::new(client));
    let connector = connector(counting.clone(), config());

    connector.prefetch("obs", RowRange::new(0, 100)).await;
    let after_prefetch = counting.gets();
    let stats = connector.cache_stats();
    // 7 chunks of lat, 4 of count.
    assert_eq!(stats.misses, 11);

    let first = collect(&connector, "obs", Predicate::All).await;
    let second = collect(&connector, "obs", Predicate::All).await;
    assert_eq!(first, second);
    assert_eq!(counting.gets(), after_prefetch);
    assert!(connector.cache_stats().hit_rate() > 0.5);
}

#[tokio::test]
async fn test_access_grant_reused_until_refresh() {
    let (memory, client) = testdata::memory_client(PREFIX);
    write_hierarchy(&memory).await;
    let connector = connector(client, config());

    let first = connector.access_grant("temp/0").await.unwrap();
    let second = connector.access_grant("temp/0").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.url().as_str(),
        "http://localhost:9000/bucket/datasets/root.zarr/temp/0"
    );
}
