//! Scope Bound Tests
//!
//! A bulk job works on the collection as it was when the job started:
//! - Documents written to the collection while the job runs survive it
//! - The cursor hands out strictly increasing etags and stops at the high water

mod common;

use std::time::Duration;

use serde_json::json;
use spitedocs::cursor::EtagCursor;
use spitedocs::{
    BulkOperationResult, CollectionName, CollectionOperationOptions, Etag, OperationCancelToken,
    OperationStatus, PutDocumentCommand, ReaderPool,
};

#[tokio::test]
async fn documents_added_during_delete_survive() {
    let (_dir, db) = common::open_db("late_writes.db", common::test_config(1024)).await;
    common::seed(&db, "Orders", 3).await;

    // One document per second keeps the job running for about two seconds.
    let id = db.start_delete_collection("Orders", CollectionOperationOptions::throttled(1));

    let mut state = db.operations().subscribe(id).unwrap();
    state
        .wait_for(|s| s.progress.is_some())
        .await
        .expect("operation reports its scope");

    for i in 0..2 {
        db.put(PutDocumentCommand::new(
            format!("orders/late-{i}"),
            "Orders",
            json!({"late": true}),
        ))
        .await
        .unwrap();
    }

    let finished = db.operations().wait(id).await.unwrap();
    assert_eq!(finished.status, OperationStatus::Completed);
    assert_eq!(finished.result, Some(BulkOperationResult { total: 3 }));

    let left = db.read_collection("Orders", Etag::ZERO, 10).await.unwrap();
    let keys: Vec<&str> = left.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["orders/late-0", "orders/late-1"]);

    db.shutdown().await;
}

#[tokio::test]
async fn documents_added_during_patch_are_untouched() {
    let (_dir, db) = common::open_db("late_patch.db", common::test_config(1024)).await;
    common::seed(&db, "Orders", 3).await;

    let patch = spitedocs::PatchRequest::new("this.patched = true");
    let id = db.start_patch_collection("Orders", CollectionOperationOptions::throttled(1), patch);

    let mut state = db.operations().subscribe(id).unwrap();
    state.wait_for(|s| s.progress.is_some()).await.unwrap();

    let late = db
        .put(PutDocumentCommand::new("orders/late", "Orders", json!({})))
        .await
        .unwrap();

    let finished = db.operations().wait(id).await.unwrap();
    assert_eq!(finished.status, OperationStatus::Completed);
    assert_eq!(finished.result, Some(BulkOperationResult { total: 3 }));

    let document = db.get("orders/late").await.unwrap().unwrap();
    assert_eq!(document.etag, late.etag);
    assert_eq!(document.data, json!({}));

    for i in 0..3 {
        let document = db.get(format!("orders/{i}")).await.unwrap().unwrap();
        assert_eq!(document.data["patched"], json!(true));
    }

    db.shutdown().await;
}

#[tokio::test]
async fn cursor_stops_at_high_water() {
    let (dir, db) = common::open_db("cursor.db", common::test_config(1024)).await;
    common::seed(&db, "Orders", 5).await;
    common::seed(&db, "Users", 2).await;

    let readers = ReaderPool::spawn(&dir.path().join("cursor.db"), 1).unwrap();
    let reader = readers.handle();
    let token = OperationCancelToken::new();

    let scope = reader
        .collection_scope(CollectionName::new("Orders"))
        .await
        .unwrap();
    assert_eq!(scope.total_count, 5);
    assert_eq!(scope.high_water, Etag::from_raw(5));

    let mut cursor = EtagCursor::new(CollectionName::new("Orders"), scope, 2);

    let first = cursor.next_batch(&reader, &token).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(!first.end_of_scope);

    // Re-etag an in-scope document and add a new one; both land above the
    // high water.
    db.put(PutDocumentCommand::new("orders/4", "Orders", json!({"moved": true})))
        .await
        .unwrap();
    db.put(PutDocumentCommand::new("orders/new", "Orders", json!({})))
        .await
        .unwrap();

    let mut seen = first.documents;
    while !cursor.is_exhausted() {
        let batch = cursor.next_batch(&reader, &token).await.unwrap();
        if batch.is_empty() {
            break;
        }
        seen.extend(batch.documents);
    }

    let keys: Vec<&str> = seen.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["orders/0", "orders/1", "orders/2", "orders/3"]);
    assert!(seen.windows(2).all(|w| w[0].etag < w[1].etag));
    assert!(seen.iter().all(|r| r.etag <= scope.high_water));

    // Exhausted cursors keep returning empty batches.
    assert!(cursor.next_batch(&reader, &token).await.unwrap().is_empty());

    readers.shutdown().await;
    db.shutdown().await;
}

/// The scope is captured once; an unthrottled job that finishes quickly
/// reports a total that matches what it deleted.
#[tokio::test]
async fn total_matches_scope_count() {
    let (_dir, db) = common::open_db("scope_total.db", common::test_config(7)).await;
    common::seed(&db, "Orders", 30).await;

    let scope = db.collection_scope("Orders").await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        db.delete_collection("Orders", CollectionOperationOptions::default(), |_| {}),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.total, scope.total_count);

    db.shutdown().await;
}
