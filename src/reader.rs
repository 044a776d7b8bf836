//! # Document Reader
//!
//! Read operations for SpiteDocs. Reads go straight to SQLite through
//! read-only connections, so they always see the latest committed data and
//! never block the writer (WAL mode).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                     Read-only SQLite                             │
//! │                      connections                                 │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    ┌─────────────┐
//!                    │   SQLite    │
//!                    │   (WAL)     │
//!                    └─────────────┘
//! ```
//!
//! ## Snapshots
//!
//! Every request runs as one short read transaction. In WAL mode that is a
//! consistent snapshot: [`collection_scope`] reads the high-water etag and
//! the document count of a collection under the same snapshot, which is what
//! lets a bulk job fix its scope atomically.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::codec::decode_document;
use crate::error::{Error, Result};
use crate::types::{CollectionName, Document, DocumentKey, DocumentRef, Etag, ScopeBound};

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Request Types
// =============================================================================

/// Request type for read operations.
pub enum ReadRequest {
    /// Load one document by key.
    GetDocument {
        key: DocumentKey,
        response: oneshot::Sender<Result<Option<Document>>>,
    },
    /// Capture a collection's scope bound under one snapshot.
    CollectionScope {
        collection: CollectionName,
        response: oneshot::Sender<Result<ScopeBound>>,
    },
    /// Scan `{key, etag}` pairs strictly after an etag.
    ScanCollection {
        collection: CollectionName,
        after: Etag,
        limit: usize,
        response: oneshot::Sender<Result<Vec<DocumentRef>>>,
    },
    /// Load full documents strictly after an etag.
    ReadCollection {
        collection: CollectionName,
        after: Etag,
        limit: usize,
        response: oneshot::Sender<Result<Vec<Document>>>,
    },
    /// Shutdown one reader thread.
    Shutdown,
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Loads a document by key. Returns `None` if it doesn't exist.
pub fn get_document(conn: &Connection, key: &DocumentKey) -> Result<Option<Document>> {
    let row = conn
        .query_row(
            "SELECT collection, etag, last_modified_ms, checksum, data
             FROM documents WHERE key = ?",
            params![key.as_str()],
            |row| {
                let collection: String = row.get(0)?;
                let etag: i64 = row.get(1)?;
                let last_modified_ms: i64 = row.get(2)?;
                let checksum: Vec<u8> = row.get(3)?;
                let data: Vec<u8> = row.get(4)?;
                Ok((collection, etag, last_modified_ms, checksum, data))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((collection, etag, last_modified_ms, checksum, data)) => Ok(Some(Document {
            data: decode_document(key.as_str(), &data, &checksum)?,
            key: key.clone(),
            collection: CollectionName::new(collection),
            etag: Etag::from_raw(etag as u64),
            last_modified_ms: last_modified_ms as u64,
        })),
    }
}

/// Returns the largest etag in a collection, or [`Etag::ZERO`] if it is empty.
pub fn last_etag_for_collection(conn: &Connection, collection: &CollectionName) -> Result<Etag> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(etag) FROM documents WHERE collection = ?",
        params![collection.as_str()],
        |row| row.get(0),
    )?;

    Ok(max.map_or(Etag::ZERO, |e| Etag::from_raw(e as u64)))
}

/// Returns the number of documents in a collection.
pub fn count_documents(conn: &Connection, collection: &CollectionName) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE collection = ?",
        params![collection.as_str()],
        |row| row.get(0),
    )?;

    Ok(count as u64)
}

/// Captures a collection's high-water etag and document count under a single
/// read snapshot.
pub fn collection_scope(conn: &Connection, collection: &CollectionName) -> Result<ScopeBound> {
    let tx = conn.unchecked_transaction()?;
    let high_water = last_etag_for_collection(&tx, collection)?;
    let total_count = count_documents(&tx, collection)?;
    tx.commit()?;

    Ok(ScopeBound {
        high_water,
        total_count,
    })
}

/// Scans a collection in ascending etag order, starting strictly after
/// `after`, returning at most `limit` entries.
pub fn scan_collection(
    conn: &Connection,
    collection: &CollectionName,
    after: Etag,
    limit: usize,
) -> Result<Vec<DocumentRef>> {
    let mut stmt = conn.prepare(
        "SELECT key, etag FROM documents
         WHERE collection = ? AND etag > ?
         ORDER BY etag
         LIMIT ?",
    )?;

    let rows = stmt.query_map(
        params![collection.as_str(), after.as_raw() as i64, limit as i64],
        |row| {
            let key: String = row.get(0)?;
            let etag: i64 = row.get(1)?;
            Ok(DocumentRef::new(key, Etag::from_raw(etag as u64)))
        },
    )?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

/// Like [`scan_collection`], but loads full documents.
pub fn read_collection(
    conn: &Connection,
    collection: &CollectionName,
    after: Etag,
    limit: usize,
) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(
        "SELECT key, etag, last_modified_ms, checksum, data FROM documents
         WHERE collection = ? AND etag > ?
         ORDER BY etag
         LIMIT ?",
    )?;

    let rows = stmt.query_map(
        params![collection.as_str(), after.as_raw() as i64, limit as i64],
        |row| {
            let key: String = row.get(0)?;
            let etag: i64 = row.get(1)?;
            let last_modified_ms: i64 = row.get(2)?;
            let checksum: Vec<u8> = row.get(3)?;
            let data: Vec<u8> = row.get(4)?;
            Ok((key, etag, last_modified_ms, checksum, data))
        },
    )?;

    let mut documents = Vec::new();
    for row in rows {
        let (key, etag, last_modified_ms, checksum, data) = row?;
        documents.push(Document {
            data: decode_document(&key, &data, &checksum)?,
            key: DocumentKey::new(key),
            collection: collection.clone(),
            etag: Etag::from_raw(etag as u64),
            last_modified_ms: last_modified_ms as u64,
        });
    }

    Ok(documents)
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// Threads compete for the shared receiver; whichever is free picks up the
/// next request.
pub async fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        match request {
            Some(ReadRequest::GetDocument { key, response }) => {
                let _ = response.send(get_document(&conn, &key));
            }
            Some(ReadRequest::CollectionScope {
                collection,
                response,
            }) => {
                let _ = response.send(collection_scope(&conn, &collection));
            }
            Some(ReadRequest::ScanCollection {
                collection,
                after,
                limit,
                response,
            }) => {
                let _ = response.send(scan_collection(&conn, &collection, after, limit));
            }
            Some(ReadRequest::ReadCollection {
                collection,
                after,
                limit,
                response,
            }) => {
                let _ = response.send(read_collection(&conn, &collection, after, limit));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Reader Pool
// =============================================================================

/// Async handle for submitting read requests to the pool.
#[derive(Clone)]
pub struct ReaderHandle {
    tx: mpsc::Sender<ReadRequest>,
}

impl ReaderHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::WriterUnavailable("reader pool has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::WriterUnavailable("reader dropped response".to_string()))?
    }

    /// Loads a document by key.
    pub async fn get_document(&self, key: DocumentKey) -> Result<Option<Document>> {
        self.request(|response| ReadRequest::GetDocument { key, response })
            .await
    }

    /// Captures a collection's scope bound.
    pub async fn collection_scope(&self, collection: CollectionName) -> Result<ScopeBound> {
        self.request(|response| ReadRequest::CollectionScope {
            collection,
            response,
        })
        .await
    }

    /// Scans `{key, etag}` pairs strictly after `after`.
    pub async fn scan_collection(
        &self,
        collection: CollectionName,
        after: Etag,
        limit: usize,
    ) -> Result<Vec<DocumentRef>> {
        self.request(|response| ReadRequest::ScanCollection {
            collection,
            after,
            limit,
            response,
        })
        .await
    }

    /// Loads full documents strictly after `after`.
    pub async fn read_collection(
        &self,
        collection: CollectionName,
        after: Etag,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.request(|response| ReadRequest::ReadCollection {
            collection,
            after,
            limit,
            response,
        })
        .await
    }
}

/// A pool of reader threads, each owning a read-only connection.
pub struct ReaderPool {
    handle: ReaderHandle,
    threads: Vec<JoinHandle<()>>,
}

impl ReaderPool {
    /// Spawns `count` reader threads on the database at `path`.
    ///
    /// The database must already be initialized (see [`crate::Database`]).
    pub fn spawn(path: &Path, count: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::with_capacity(count);

        for i in 0..count.max(1) {
            // Open on the caller's thread so failures surface from `spawn`.
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            let rx = Arc::clone(&rx);

            let thread = thread::Builder::new()
                .name(format!("spitedocs-reader-{}", i))
                .spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to create reader runtime");

                    rt.block_on(run_reader_pooled(conn, rx));
                })
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {}", e)))?;

            threads.push(thread);
        }

        Ok(Self {
            handle: ReaderHandle { tx },
            threads,
        })
    }

    /// Returns a handle for submitting requests.
    pub fn handle(&self) -> ReaderHandle {
        self.handle.clone()
    }

    /// Number of reader threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Stops every reader thread and waits for them to exit.
    pub async fn shutdown(self) {
        for _ in 0..self.threads.len() {
            let _ = self.handle.tx.send(ReadRequest::Shutdown).await;
        }

        let threads = self.threads;
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_document;
    use crate::schema::Database;
    use serde_json::json;

    fn setup_test_db() -> Connection {
        Database::open_in_memory().unwrap().into_connection()
    }

    fn insert_doc(conn: &Connection, key: &str, collection: &str, etag: u64) {
        let (data, checksum) = encode_document(&json!({"key": key})).unwrap();
        conn.execute(
            "INSERT INTO documents (key, collection, etag, last_modified_ms, checksum, data)
             VALUES (?, ?, ?, 0, ?, ?)",
            params![key, collection, etag as i64, checksum, data],
        )
        .unwrap();
    }

    #[test]
    fn test_scope_of_orders() {
        let conn = setup_test_db();
        insert_doc(&conn, "orders/1", "Orders", 5);
        insert_doc(&conn, "users/1", "Users", 6);
        insert_doc(&conn, "orders/2", "Orders", 7);
        insert_doc(&conn, "orders/3", "Orders", 9);
        insert_doc(&conn, "users/2", "Users", 10);

        let scope = collection_scope(&conn, &CollectionName::new("Orders")).unwrap();
        assert_eq!(scope.high_water, Etag::from_raw(9));
        assert_eq!(scope.total_count, 3);
    }

    #[test]
    fn test_scope_of_empty_collection() {
        let conn = setup_test_db();

        let scope = collection_scope(&conn, &CollectionName::new("Nothing")).unwrap();
        assert_eq!(scope.high_water, Etag::ZERO);
        assert_eq!(scope.total_count, 0);
    }

    #[test]
    fn test_scan_is_exclusive_ordered_and_limited() {
        let conn = setup_test_db();
        insert_doc(&conn, "orders/c", "Orders", 9);
        insert_doc(&conn, "orders/a", "Orders", 5);
        insert_doc(&conn, "orders/b", "Orders", 7);
        insert_doc(&conn, "users/1", "Users", 6);

        let collection = CollectionName::new("Orders");

        let all = scan_collection(&conn, &collection, Etag::ZERO, 10).unwrap();
        let etags: Vec<u64> = all.iter().map(|d| d.etag.as_raw()).collect();
        assert_eq!(etags, vec![5, 7, 9]);

        let after_five = scan_collection(&conn, &collection, Etag::from_raw(5), 1).unwrap();
        assert_eq!(after_five, vec![DocumentRef::new("orders/b", Etag::from_raw(7))]);

        let none = scan_collection(&conn, &collection, Etag::from_raw(9), 10).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_get_document_detects_corruption() {
        let conn = setup_test_db();
        insert_doc(&conn, "orders/1", "Orders", 1);
        conn.execute("UPDATE documents SET checksum = x'00'", []).unwrap();

        let err = get_document(&conn, &DocumentKey::new("orders/1")).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));

        assert!(get_document(&conn, &DocumentKey::new("missing")).unwrap().is_none());
    }

    #[test]
    fn test_read_collection() {
        let conn = setup_test_db();
        insert_doc(&conn, "orders/1", "Orders", 1);
        insert_doc(&conn, "orders/2", "Orders", 2);

        let docs = read_collection(&conn, &CollectionName::new("Orders"), Etag::ZERO, 10).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].data, json!({"key": "orders/2"}));
    }
}
