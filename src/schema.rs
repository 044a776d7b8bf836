//! # SQLite Schema for SpiteDocs
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  documents                             spitedocs_metadata               │
//! │  ┌──────────────────────┐              ┌─────────────────────┐          │
//! │  │ key (PK)             │              │ key (PK)            │          │
//! │  │ collection ──┐       │              │ value               │          │
//! │  │ etag (UNIQUE)│       │              └─────────────────────┘          │
//! │  │ last_modified_ms     │               schema_version, last_etag       │
//! │  │ checksum     │       │                                               │
//! │  │ data BLOB    │       │                                               │
//! │  └──────────────┼───────┘                                               │
//! │                 ▼                                                       │
//! │     INDEX documents_collection_etag (collection, etag)                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why a (collection, etag) index?
//!
//! Bulk operations walk one collection in ascending etag order, a batch at a
//! time, and need the collection's largest etag and document count at job
//! start. All three are range queries on `(collection, etag)`.
//!
//! ### Why persist `last_etag`?
//!
//! `MAX(etag)` over the documents table goes backwards when the newest
//! document is deleted. Etags must never be reused, so the writer persists
//! the last etag it handed out in the same transaction as the writes.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Metadata key holding the last etag handed out by the writer.
pub(crate) const LAST_ETAG_KEY: &str = "last_etag";

// =============================================================================
// DDL Statements
// =============================================================================

/// The `documents` table stores one row per live document.
///
/// # Columns
///
/// - `key`: Document key (primary key)
/// - `collection`: Collection name
/// - `etag`: Etag of the current version, unique across the database
/// - `last_modified_ms`: Unix timestamp in milliseconds of the last write
/// - `checksum`: XXH3-64 of `data`
/// - `data`: JSON body
const CREATE_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    key              TEXT PRIMARY KEY,
    collection       TEXT NOT NULL,
    etag             INTEGER NOT NULL UNIQUE,
    last_modified_ms INTEGER NOT NULL,
    checksum         BLOB NOT NULL,
    data             BLOB NOT NULL
)
"#;

/// Supports per-collection etag-ordered scans, `MAX(etag)` and `COUNT(*)`.
const CREATE_DOCUMENTS_COLLECTION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS documents_collection_etag
ON documents(collection, etag)
"#;

/// Metadata table for schema versioning and the etag counter.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitedocs_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the SpiteDocs schema.
///
/// `Database` owns its `Connection`. Use [`Database::into_connection`] to
/// hand the initialized connection to the batch writer.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use spitedocs::Database;
    ///
    /// let db = Database::open("documents.db")?;
    /// # Ok::<(), spitedocs::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to one connection, so they only suit
    /// tests that exercise the writer alone.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while the writer commits.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_DOCUMENTS)?;
        self.conn.execute_batch(CREATE_DOCUMENTS_COLLECTION_INDEX)?;

        self.verify_or_set_version()?;

        self.conn.execute(
            "INSERT OR IGNORE INTO spitedocs_metadata (key, value) VALUES (?, '0')",
            [LAST_ETAG_KEY],
        )?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM spitedocs_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO spitedocs_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this SpiteDocs version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Reads the persisted last etag from the metadata table.
pub(crate) fn load_last_etag(conn: &Connection) -> Result<u64> {
    let value: String = conn.query_row(
        "SELECT value FROM spitedocs_metadata WHERE key = ?",
        [LAST_ETAG_KEY],
        |row| row.get(0),
    )?;

    value
        .parse()
        .map_err(|_| Error::Schema(format!("invalid last_etag value '{value}'")))
}

/// Persists the last etag handed out. Must run inside the write transaction.
pub(crate) fn store_last_etag(conn: &Connection, last_etag: u64) -> Result<()> {
    conn.execute(
        "UPDATE spitedocs_metadata SET value = ? WHERE key = ?",
        rusqlite::params![last_etag.to_string(), LAST_ETAG_KEY],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
