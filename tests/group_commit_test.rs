//! Group Commit Semantics Tests
//!
//! Tests the invariants around batched writes:
//! - Concurrent commands are batched together and get contiguous etags
//! - Batch timeout and batch max size trigger a flush
//! - A failing command gives its etags back without affecting its batch
//! - Commit failure fails all commands in the batch
//! - Bulk jobs share the writer with ordinary writes

mod common;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde_json::json;
use spitedocs::{
    spawn_batch_writer, BatchWriterHandle, CollectionOperationOptions, Database, Error, Etag,
    PutDocumentCommand, WriterConfig,
};

fn spawn_writer(
    path: &std::path::Path,
    config: WriterConfig,
) -> (BatchWriterHandle, std::thread::JoinHandle<()>) {
    let writer_db = Database::open(path).unwrap();
    spawn_batch_writer(writer_db.into_connection(), config).unwrap()
}

fn put(i: usize) -> PutDocumentCommand {
    PutDocumentCommand::new(format!("docs/{i}"), "Docs", json!({"i": i}))
}

async fn put_concurrently(
    writer: &BatchWriterHandle,
    count: usize,
) -> Vec<spitedocs::Result<spitedocs::PutResult>> {
    let mut handles = Vec::new();
    for i in 0..count {
        let w = writer.clone();
        handles.push(tokio::spawn(async move { w.put(put(i)).await }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

/// Tests that concurrent commands are batched and get etags 1..=N.
#[tokio::test]
async fn group_commit_concurrent_puts_get_contiguous_etags() {
    let (_dir, path) = common::create_temp_db_file("batch_concurrent.db");

    // Use longer batch timeout to ensure commands are grouped
    let config = WriterConfig {
        batch_timeout: Duration::from_millis(50),
        batch_max_size: 100,
    };
    let (writer, thread) = spawn_writer(&path, config);

    let etags: BTreeSet<u64> = put_concurrently(&writer, 10)
        .await
        .into_iter()
        .map(|r| r.unwrap().etag.as_raw())
        .collect();
    assert_eq!(etags, (1..=10).collect());

    writer.shutdown().await;
    thread.join().unwrap();

    let read_conn = common::open_read_only(&path);
    let count: i64 = read_conn
        .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 10);
}

/// Tests that batch timeout flushes a lone command.
#[tokio::test]
async fn group_commit_timeout_flushes_batch() {
    let (_dir, path) = common::create_temp_db_file("batch_timeout.db");

    let config = WriterConfig {
        batch_timeout: Duration::from_millis(20),
        batch_max_size: 1000,
    };
    let (writer, thread) = spawn_writer(&path, config);

    let result = tokio::time::timeout(Duration::from_secs(5), writer.put(put(1)))
        .await
        .expect("flushed by timeout")
        .unwrap();
    assert_eq!(result.etag, Etag::FIRST);

    writer.shutdown().await;
    thread.join().unwrap();
}

/// Tests that batch max size flushes without waiting for the timeout.
#[tokio::test]
async fn group_commit_max_size_flushes_batch() {
    let (_dir, path) = common::create_temp_db_file("batch_max_size.db");

    let config = WriterConfig {
        batch_timeout: Duration::from_secs(5),
        batch_max_size: 5,
    };
    let (writer, thread) = spawn_writer(&path, config);

    let start = Instant::now();
    let results = put_concurrently(&writer, 20).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(
        start.elapsed() < Duration::from_secs(4),
        "full batches waited for the timeout: {:?}",
        start.elapsed()
    );

    writer.shutdown().await;
    thread.join().unwrap();
}

/// Tests that a conflicting command neither fails its batch nor burns etags.
#[tokio::test]
async fn group_commit_failed_command_gives_etags_back() {
    let (_dir, path) = common::create_temp_db_file("batch_isolation.db");

    let config = WriterConfig {
        batch_timeout: Duration::from_millis(50),
        batch_max_size: 100,
    };
    let (writer, thread) = spawn_writer(&path, config);

    writer.put(put(0)).await.unwrap();

    let stale = PutDocumentCommand::new("docs/0", "Docs", json!({"stale": true}))
        .with_expected_etag(Etag::from_raw(99));
    let (a, conflict, b) = tokio::join!(
        writer.put(put(1)),
        writer.put(stale),
        writer.put(put(2)),
    );

    assert!(matches!(
        conflict,
        Err(Error::ConcurrencyConflict { .. })
    ));
    let etags: BTreeSet<u64> = [a.unwrap().etag.as_raw(), b.unwrap().etag.as_raw()].into();
    assert_eq!(etags, BTreeSet::from([2, 3]));

    writer.shutdown().await;
    thread.join().unwrap();
}

/// Tests that a failing COMMIT answers every command with an error and
/// doesn't advance the etag.
#[tokio::test]
async fn group_commit_failure_fails_whole_batch() {
    let (_dir, path) = common::create_temp_db_file("batch_commit_failure.db");

    // Any attempt to persist a new last etag aborts.
    let admin = common::open_read_write(&path);
    admin
        .execute_batch(
            "CREATE TRIGGER reject_etag BEFORE UPDATE ON spitedocs_metadata
             WHEN NEW.key = 'last_etag'
             BEGIN SELECT RAISE(ABORT, 'etag store rejected'); END;",
        )
        .unwrap();

    let config = WriterConfig {
        batch_timeout: Duration::from_millis(50),
        batch_max_size: 100,
    };
    let (writer, thread) = spawn_writer(&path, config);

    for result in put_concurrently(&writer, 3).await {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Schema(ref msg) if msg.contains("batch commit failed")), "{err:?}");
    }

    admin.execute_batch("DROP TRIGGER reject_etag").unwrap();

    let result = writer.put(put(7)).await.unwrap();
    assert_eq!(result.etag, Etag::FIRST);

    writer.shutdown().await;
    thread.join().unwrap();

    let read_conn = common::open_read_only(&path);
    let count: i64 = read_conn
        .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

/// A bulk delete and ordinary writes to another collection interleave in the
/// same writer.
#[tokio::test]
async fn group_commit_bulk_job_shares_writer() {
    let (_dir, db) = common::open_db("bulk_shared.db", common::test_config(8)).await;
    common::seed(&db, "Orders", 50).await;

    let writes = {
        let db = db.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                db.put(PutDocumentCommand::new(
                    format!("users/{i}"),
                    "Users",
                    json!({}),
                ))
                .await
                .unwrap();
            }
        })
    };

    let result = db
        .delete_collection("Orders", CollectionOperationOptions::default(), |_| {})
        .await
        .unwrap();
    writes.await.unwrap();

    assert_eq!(result.total, 50);
    assert_eq!(db.collection_scope("Orders").await.unwrap().total_count, 0);
    assert_eq!(db.collection_scope("Users").await.unwrap().total_count, 20);

    db.shutdown().await;
}
