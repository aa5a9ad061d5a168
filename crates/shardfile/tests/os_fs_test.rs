//! Integration tests for the engine on the real filesystem.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use bytes::Bytes;
use shardfile::{Engine, OsFs, ReadRequest, StoreConfig, WriteRequest};
use tempfile::TempDir;

#[tokio::test]
async fn test_data_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let root = temp_dir.path().join("shards");
    let config = StoreConfig::new(&root).with_num_workers(4);

    let engine = Engine::<String, _>::open(OsFs::new(), config.clone()).expect("engine should open");
    let (writer, mut written) = engine.writer();
    writer
        .write_batch(vec![
            WriteRequest::new("cpu".to_string(), "first,"),
            WriteRequest::new("cpu".to_string(), "second"),
        ])
        .await
        .expect("batch should submit");
    for _ in 0..2 {
        written
            .recv()
            .await
            .expect("write response")
            .result
            .expect("write should succeed");
    }
    drop(writer);
    engine.shutdown().await.expect("shutdown should succeed");

    assert_eq!(
        std::fs::read(root.join("cpu.kfs")).expect("file should exist"),
        b"first,second"
    );

    // A second engine over the same root appends after the existing data
    let engine = Engine::<String, _>::open(OsFs::new(), config).expect("engine should reopen");
    let (writer, mut written) = engine.writer();
    writer
        .write(WriteRequest::new("cpu".to_string(), "+third"))
        .await
        .expect("write should submit");
    let offset = written.recv().await.expect("write response").result;
    assert_eq!(offset.expect("write should succeed"), 12);

    let (reader, mut read) = engine.reader();
    reader
        .read(ReadRequest::new("cpu".to_string(), 6, 12))
        .await
        .expect("read should submit");
    let data = read.recv().await.expect("read response").result;
    assert_eq!(data.expect("read should succeed"), Bytes::from("second+third"));

    assert_eq!(engine.store().disk_len(&"cpu".to_string()).expect("stat"), 18);

    drop((writer, reader));
    engine.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn test_remove_all_deletes_backing_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = StoreConfig::new(temp_dir.path()).with_suffix(".shard");
    let engine = Engine::<u32, _>::open(OsFs::new(), config).expect("engine should open");

    let (writer, mut written) = engine.writer();
    for key in 0..3u32 {
        writer
            .write(WriteRequest::new(key, "data"))
            .await
            .expect("write should submit");
        written.recv().await.expect("write response");
    }
    for key in 0..3u32 {
        assert!(temp_dir.path().join(format!("{key}.shard")).exists());
    }

    engine.store().remove_all().await.expect("remove_all should succeed");
    engine.store().remove_all().await.expect("second remove_all should succeed");
    assert!(engine.store().is_empty());
    for key in 0..3u32 {
        assert!(!temp_dir.path().join(format!("{key}.shard")).exists());
    }

    drop(writer);
    engine.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn test_read_past_end_reports_short_read() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let engine = Engine::<u32, _>::open(OsFs::new(), StoreConfig::new(temp_dir.path()))
        .expect("engine should open");

    let (reader, mut read) = engine.reader();
    reader
        .read(ReadRequest::new(7, 0, 4))
        .await
        .expect("read should submit");
    let response = read.recv().await.expect("read response");
    assert!(matches!(
        response.result,
        Err(shardfile::StoreError::ShortRead { actual: 0, .. })
    ));

    drop(reader);
    engine.shutdown().await.expect("shutdown should succeed");
}
