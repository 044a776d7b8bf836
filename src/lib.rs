//! # SpiteDocs - Document Store with Collection-Wide Bulk Operations
//!
//! SpiteDocs is a document store built on SQLite. It provides:
//!
//! - **Keyed JSON documents** grouped into collections and stamped with
//!   global, never-reused etags
//! - **High-throughput writes**: every write goes through one group-commit
//!   writer (the transaction merger)
//! - **Bulk collection operations**: delete or patch every document of a
//!   collection, throttled, cancellable and with progress reporting
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 DocumentDatabase (async API)                    │
//! │         put / get / delete      delete_collection / patch       │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                │                               │
//!                │                               ▼
//!                │                 ┌──────────────────────────────┐
//!                │                 │      CollectionRunner        │
//!                │                 │  scope → EtagCursor batches  │
//!                │                 │  → BulkCommand (+ RateGate)  │
//!                │                 └───────┬──────────────┬───────┘
//!                ▼                         ▼              ▼
//! ┌──────────────────────────────────────────┐  ┌───────────────────┐
//! │      Batch Writer (transaction merger)   │  │    Reader Pool    │
//! │ single thread, group commit, SAVEPOINTs  │  │ read-only conns   │
//! └──────────────────────┬───────────────────┘  └─────────┬─────────┘
//!                        └──────────────┬─────────────────┘
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │  SQLite (WAL)   │
//!                              └─────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: exactly one write transaction is open at any instant
//! 2. **Etags**: strictly increase across the database, never reused
//! 3. **Bounded scope**: a bulk job never visits a document whose etag is
//!    above the high water captured when it started
//! 4. **Exactly once**: a bulk job hands each in-scope key to the writer at
//!    most once
//! 5. **Commit before answer**: a writer caller is answered only after its
//!    transaction committed
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Domain types (DocumentKey, CollectionName, Etag, ...)
//! - [`codec`]: Document body encoding and checksums
//! - [`patch`]: Patch scripts, compiled once per job
//! - [`writer`]: Batch writer with group commit and SAVEPOINT isolation
//! - [`reader`]: Read operations with pooled connections
//! - [`rate_gate`]: Per-second throttle for bulk jobs
//! - [`cancel`]: Cooperative cancellation with inactivity timeout
//! - [`cursor`]: Bounded etag-ordered collection scan
//! - [`bulk_command`]: The merged command a bulk job submits
//! - [`runner`]: The bulk job loop
//! - [`operations`]: Registry of background operations
//! - [`config`]: Configuration and environment overrides
//! - [`api`]: Async API (main entry point)

pub mod error;

pub mod schema;

/// Domain types. Uses the newtype pattern for type safety.
pub mod types;

pub mod codec;

pub mod patch;

/// Batch writer with group commit.
///
/// Commands are collected over a configurable time window (default 10ms) and
/// executed together, each in its own SAVEPOINT, amortizing the cost of
/// fsync. Both plain document writes and bulk jobs go through it.
pub mod writer;

pub mod reader;

pub mod rate_gate;

pub mod cancel;

pub mod cursor;

pub mod bulk_command;

/// Collection-wide bulk operations.
///
/// The main entry points are
/// [`CollectionRunner::execute_delete`](runner::CollectionRunner::execute_delete)
/// and [`CollectionRunner::execute_patch`](runner::CollectionRunner::execute_patch).
pub mod runner;

pub mod operations;

pub mod config;

/// Async API for SpiteDocs.
///
/// The main entry point is [`DocumentDatabase`](api::DocumentDatabase).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::DocumentDatabase;
pub use bulk_command::{BulkCommand, CollectionAction};
pub use cancel::OperationCancelToken;
pub use config::DatabaseConfig;
pub use error::{Error, Result};
pub use operations::{OperationId, OperationState, OperationStatus, Operations};
pub use patch::{CompiledPatch, PatchRequest};
pub use rate_gate::RateGate;
pub use reader::{ReaderHandle, ReaderPool};
pub use runner::{
    BulkOperationResult, CollectionOperationOptions, CollectionRunner, DeterminateProgress,
    RunnerConfig,
};
pub use schema::Database;
pub use writer::{
    spawn_batch_writer, BatchWriterHandle, Executed, MergedCommand, PatchOutcome,
    WriteTransaction, WriterConfig,
};

pub use types::{
    CollectionName, DeleteResult, Document, DocumentKey, DocumentRef, Etag, PutDocumentCommand,
    PutResult, ScopeBound,
};
