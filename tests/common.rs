#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde_json::json;
use spitedocs::{
    Database, DatabaseConfig, DeterminateProgress, DocumentDatabase, PutDocumentCommand, PutResult,
    RunnerConfig,
};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub fn test_config(bulk_batch_size: usize) -> DatabaseConfig {
    DatabaseConfig {
        runner: RunnerConfig {
            batch_size: bulk_batch_size,
        },
        reader_threads: 2,
        ..DatabaseConfig::default()
    }
}

/// Opens a database in a temp dir. Keep the dir alive for the db to work.
pub async fn open_db(name: &str, config: DatabaseConfig) -> (tempfile::TempDir, DocumentDatabase) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let db = DocumentDatabase::open_with_config(dir.path().join(name), config)
        .await
        .expect("open database");
    (dir, db)
}

/// Writes `count` documents `{collection-lowercase}/{i}` with body `{"index": i}`.
pub async fn seed(db: &DocumentDatabase, collection: &str, count: usize) -> Vec<PutResult> {
    let prefix = collection.to_lowercase();
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let result = db
            .put(PutDocumentCommand::new(
                format!("{prefix}/{i}"),
                collection,
                json!({"index": i}),
            ))
            .await
            .expect("seed document");
        results.push(result);
    }
    results
}

/// Records every progress report.
#[derive(Clone, Default)]
pub struct ProgressLog {
    reports: Arc<Mutex<Vec<DeterminateProgress>>>,
}

impl ProgressLog {
    pub fn callback(&self) -> impl FnMut(DeterminateProgress) + Send + 'static {
        let reports = Arc::clone(&self.reports);
        move |progress| reports.lock().push(progress)
    }

    pub fn reports(&self) -> Vec<DeterminateProgress> {
        self.reports.lock().clone()
    }
}

pub fn progress(total: u64, processed: u64) -> DeterminateProgress {
    DeterminateProgress { total, processed }
}
