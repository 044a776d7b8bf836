//! # Async API for SpiteDocs
//!
//! [`DocumentDatabase`] is the public async handle. It owns the single batch
//! writer, a pool of reader threads, the collection runner and the registry
//! of long-running operations.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` type uses `RefCell` internally, making it `!Sync`.
//! This means we can't share a connection across threads, even with `Arc`.
//!
//! Our solution: **Dedicated threads with async channels**
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                                  │
//! │           put / get / delete          delete_collection / patch ...     │
//! └────────────────────────────────┬────────────────────────────────────────┘
//!                    ┌─────────────┴─────────────┐
//!                    │                           │
//!                    ▼                           ▼
//!            ┌───────────────┐         ┌─────────────────────┐
//!            │ Batch Writer  │         │     Reader Pool     │
//!            │  (1 thread)   │         │    (N threads)      │
//!            │  group commit │         │  read-only conns    │
//!            └───────┬───────┘         └──────────┬──────────┘
//!                    │                            │
//!                    └─────────────┬──────────────┘
//!                                  ▼
//!                          ┌─────────────┐
//!                          │   SQLite    │
//!                          │   (WAL)     │
//!                          └─────────────┘
//! ```
//!
//! Bulk jobs run on the caller's task (`delete_collection`,
//! `patch_collection`) or in the background as tracked operations
//! (`start_delete_collection`, `start_patch_collection`).

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cancel::OperationCancelToken;
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::operations::{OperationId, Operations};
use crate::patch::PatchRequest;
use crate::reader::{ReaderHandle, ReaderPool};
use crate::runner::{
    BulkOperationResult, CollectionOperationOptions, CollectionRunner, DeterminateProgress,
};
use crate::schema::Database;
use crate::types::{
    CollectionName, DeleteResult, Document, DocumentKey, DocumentRef, Etag, PutDocumentCommand,
    PutResult, ScopeBound,
};
use crate::writer::{spawn_batch_writer, BatchWriterHandle};

/// The main async handle for SpiteDocs.
///
/// `DocumentDatabase` is `Clone`, `Send`, and `Sync`. All clones share the
/// same writer, readers and operation registry.
///
/// # Example
///
/// ```rust,ignore
/// use spitedocs::{CollectionOperationOptions, DocumentDatabase, PutDocumentCommand};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> spitedocs::Result<()> {
///     let db = DocumentDatabase::open("documents.db").await?;
///
///     db.put(PutDocumentCommand::new("orders/1", "Orders", json!({"total": 10})))
///         .await?;
///
///     let result = db
///         .delete_collection("Orders", CollectionOperationOptions::default(), |p| {
///             println!("{}/{}", p.processed, p.total);
///         })
///         .await?;
///     println!("deleted {}", result.total);
///
///     db.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct DocumentDatabase {
    writer: BatchWriterHandle,
    reader: ReaderHandle,
    runner: CollectionRunner,
    operations: Operations,
    config: Arc<DatabaseConfig>,
    /// Parent of every job's cancel token; fired by `shutdown`.
    shutdown: CancellationToken,
    threads: Arc<Mutex<Option<Threads>>>,
}

struct Threads {
    readers: ReaderPool,
    writer: JoinHandle<()>,
}

impl DocumentDatabase {
    /// Opens or creates a database with configuration from the environment.
    ///
    /// See [`DatabaseConfig::from_env`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::from_env()?).await
    }

    /// Opens or creates a database with explicit configuration.
    pub async fn open_with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();

        // The writer's connection creates the schema before any reader opens.
        let db = Database::open(path)?;
        let (writer, writer_thread) = spawn_batch_writer(db.into_connection(), config.writer.clone())?;
        let readers = ReaderPool::spawn(path, config.reader_threads)?;
        let reader = readers.handle();

        let runner = CollectionRunner::new(reader.clone(), writer.clone(), config.runner.clone());

        info!(
            path = %path.display(),
            reader_threads = readers.thread_count(),
            bulk_batch_size = config.runner.batch_size,
            "database opened"
        );

        Ok(Self {
            writer,
            reader,
            runner,
            operations: Operations::with_retention(config.operation_retention),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            threads: Arc::new(Mutex::new(Some(Threads {
                readers,
                writer: writer_thread,
            }))),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The shared transaction merger. Custom [`crate::MergedCommand`]s are
    /// enqueued here.
    pub fn writer(&self) -> &BatchWriterHandle {
        &self.writer
    }

    pub fn runner(&self) -> &CollectionRunner {
        &self.runner
    }

    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Inserts or replaces a document.
    ///
    /// # Errors
    ///
    /// - `Error::ConcurrencyConflict` if `expected_etag` is set and doesn't match
    pub async fn put(&self, command: PutDocumentCommand) -> Result<PutResult> {
        self.writer.put(command).await
    }

    /// Loads a document. Returns `None` if it doesn't exist.
    pub async fn get(&self, key: impl Into<DocumentKey>) -> Result<Option<Document>> {
        self.reader.get_document(key.into()).await
    }

    /// Deletes a document. Deleting a missing document succeeds with
    /// `deleted_etag: None`.
    pub async fn delete(
        &self,
        key: impl Into<DocumentKey>,
        expected_etag: Option<Etag>,
    ) -> Result<DeleteResult> {
        self.writer.delete(key, expected_etag).await
    }

    /// Returns a collection's high-water etag and document count, read under
    /// one snapshot.
    pub async fn collection_scope(&self, collection: impl Into<CollectionName>) -> Result<ScopeBound> {
        self.reader.collection_scope(collection.into()).await
    }

    /// Lists `{key, etag}` pairs of a collection in etag order, strictly
    /// after `after`.
    pub async fn scan(
        &self,
        collection: impl Into<CollectionName>,
        after: Etag,
        limit: usize,
    ) -> Result<Vec<DocumentRef>> {
        self.reader.scan_collection(collection.into(), after, limit).await
    }

    /// Loads documents of a collection in etag order, strictly after `after`.
    pub async fn read_collection(
        &self,
        collection: impl Into<CollectionName>,
        after: Etag,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.reader.read_collection(collection.into(), after, limit).await
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Deletes every document of a collection, on the caller's task.
    pub async fn delete_collection(
        &self,
        collection: impl Into<CollectionName>,
        options: CollectionOperationOptions,
        on_progress: impl FnMut(DeterminateProgress) + Send,
    ) -> Result<BulkOperationResult> {
        let token = self.new_token();
        self.runner
            .execute_delete(&collection.into(), options, on_progress, &token)
            .await
    }

    /// Patches every document of a collection, on the caller's task.
    pub async fn patch_collection(
        &self,
        collection: impl Into<CollectionName>,
        options: CollectionOperationOptions,
        patch: &PatchRequest,
        on_progress: impl FnMut(DeterminateProgress) + Send,
    ) -> Result<BulkOperationResult> {
        let token = self.new_token();
        self.runner
            .execute_patch(&collection.into(), options, patch, on_progress, &token)
            .await
    }

    /// Starts deleting every document of a collection in the background.
    ///
    /// Track it through [`DocumentDatabase::operations`].
    pub fn start_delete_collection(
        &self,
        collection: impl Into<CollectionName>,
        options: CollectionOperationOptions,
    ) -> OperationId {
        let collection = collection.into();
        let description = format!("delete all documents of collection '{collection}'");
        let token = self.new_token();
        let runner = self.runner.clone();

        self.operations
            .spawn(description, token.clone(), move |reporter| async move {
                runner
                    .execute_delete(&collection, options, move |p| reporter.report(p), &token)
                    .await
            })
    }

    /// Starts patching every document of a collection in the background.
    pub fn start_patch_collection(
        &self,
        collection: impl Into<CollectionName>,
        options: CollectionOperationOptions,
        patch: PatchRequest,
    ) -> OperationId {
        let collection = collection.into();
        let description = format!("patch all documents of collection '{collection}'");
        let token = self.new_token();
        let runner = self.runner.clone();

        self.operations
            .spawn(description, token.clone(), move |reporter| async move {
                runner
                    .execute_patch(&collection, options, &patch, move |p| reporter.report(p), &token)
                    .await
            })
    }

    fn new_token(&self) -> OperationCancelToken {
        OperationCancelToken::child_of(&self.shutdown, self.config.operation_timeout)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shuts down the database gracefully.
    ///
    /// Every running bulk job is canceled first, whether it runs in the
    /// background or on a caller's task, and background operations are
    /// awaited. Then the writer flushes its pending batch and the reader
    /// threads stop. Afterwards every call on any clone fails with
    /// `Error::WriterUnavailable`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for id in self.operations.ids() {
            let _ = self.operations.wait(id).await;
        }

        self.writer.shutdown().await;

        let threads = self.threads.lock().take();
        if let Some(threads) = threads {
            threads.readers.shutdown().await;
            let _ = tokio::task::spawn_blocking(move || threads.writer.join()).await;
        }

        info!("database shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::operations::OperationStatus;
    use serde_json::json;

    /// Creates a test database in a temporary directory.
    /// Returns (db, temp_dir) - temp_dir must be kept alive for the db to work.
    async fn test_db() -> (DocumentDatabase, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            reader_threads: 2,
            ..DatabaseConfig::default()
        };
        let db = DocumentDatabase::open_with_config(temp_dir.path().join("test.db"), config)
            .await
            .unwrap();
        (db, temp_dir)
    }

    #[tokio::test]
    async fn test_open() {
        let (db, _temp_dir) = test_db().await;
        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (db, _temp_dir) = test_db().await;

        let put = db
            .put(PutDocumentCommand::new("orders/1", "Orders", json!({"total": 10})))
            .await
            .unwrap();
        assert_eq!(put.etag, Etag::FIRST);

        let doc = db.get("orders/1").await.unwrap().unwrap();
        assert_eq!(doc.collection, CollectionName::new("Orders"));
        assert_eq!(doc.data, json!({"total": 10}));

        db.delete("orders/1", Some(Etag::FIRST)).await.unwrap();
        assert!(db.get("orders/1").await.unwrap().is_none());

        db.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_delete_collection_tracks_progress() {
        let (db, _temp_dir) = test_db().await;
        for i in 0..5 {
            db.put(PutDocumentCommand::new(format!("orders/{i}"), "Orders", json!({})))
                .await
                .unwrap();
        }

        let id = db.start_delete_collection("Orders", CollectionOperationOptions::default());
        let state = db.operations().wait(id).await.unwrap();

        assert_eq!(state.status, OperationStatus::Completed);
        assert_eq!(state.result, Some(BulkOperationResult { total: 5 }));
        assert_eq!(state.progress, Some(DeterminateProgress { total: 5, processed: 5 }));
        assert_eq!(db.collection_scope("Orders").await.unwrap().total_count, 0);

        db.shutdown().await;
    }

    /// A job running on a caller's task is not tracked, but shutdown still
    /// cancels it.
    #[tokio::test]
    async fn test_shutdown_cancels_direct_jobs() {
        let (db, _temp_dir) = test_db().await;
        for i in 0..5 {
            db.put(PutDocumentCommand::new(format!("orders/{i}"), "Orders", json!({})))
                .await
                .unwrap();
        }

        let job = {
            let db = db.clone();
            tokio::spawn(async move {
                db.delete_collection("Orders", CollectionOperationOptions::throttled(1), |_| {})
                    .await
            })
        };

        // The first permit is spent at once; the job then waits on the gate.
        while db.collection_scope("Orders").await.unwrap().total_count == 5 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), db.shutdown())
            .await
            .unwrap();

        let result = job.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)), "{result:?}");
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (db, _temp_dir) = test_db().await;
        let clone = db.clone();
        db.shutdown().await;

        let err = clone
            .put(PutDocumentCommand::new("orders/1", "Orders", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriterUnavailable(_)));

        let err = clone.get("orders/1").await.unwrap_err();
        assert!(matches!(err, Error::WriterUnavailable(_)));
    }
}
