//! # Batch Writer with Group Commit
//!
//! This module implements the transaction merger: the single writer through
//! which every physical write transaction in SpiteDocs passes. Plain document
//! writes and bulk collection jobs share it, so a bulk job competes fairly
//! with everything else that writes.
//!
//! ## Why Group Commit?
//!
//! SQLite's performance is limited by fsync() calls - each transaction commit requires
//! waiting for the disk to confirm the write. By batching multiple commands into one
//! transaction, we amortize this cost:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ cmd1 → BEGIN → COMMIT    │     │ BEGIN                    │
//! │ cmd2 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_0        │
//! │ cmd3 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_1        │
//! │ ...                      │     │   SAVEPOINT cmd_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Merged Commands
//!
//! Anything that implements [`MergedCommand`] can be enqueued. The writer
//! runs it against a [`WriteTransaction`] and, once the physical transaction
//! has committed, hands the command back to the caller together with its
//! output:
//!
//! ```text
//!  caller                       writer thread
//!    │  enqueue(cmd) ──────────▶ │ BEGIN IMMEDIATE
//!    │                           │ SAVEPOINT cmd_N
//!    │                           │ cmd.execute(&mut tx)
//!    │                           │ RELEASE / ROLLBACK TO
//!    │                           │ ... other callers' commands ...
//!    │                           │ COMMIT
//!    │ ◀──────── Executed{cmd, output}
//! ```
//!
//! Handing the command back is what lets a bulk job drain a batch of keys in
//! several submissions: the command keeps its own position.
//!
//! ## SAVEPOINT Semantics
//!
//! Each command executes in its own SAVEPOINT within the outer transaction:
//!
//! - If a command succeeds: SAVEPOINT is released (changes preserved)
//! - If a command fails: SAVEPOINT is rolled back (changes discarded)
//! - Other commands in the batch are unaffected
//!
//! ## Staged vs Committed Etags
//!
//! The etag counter is staged per batch. A failed command gives back the
//! etags it allocated, and the counter only advances in memory after COMMIT
//! succeeds. The last allocated etag is written to `spitedocs_metadata` in the
//! same transaction, so etags are never reused, even after the newest
//! document is deleted or the process restarts.
//!
//! ## Invariants
//!
//! - Exactly one write transaction is open at any instant
//! - A caller is answered only after its transaction committed
//! - Etags strictly increase, no gaps from failed commands
//! - Commands are processed in arrival order within a batch

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{current_time_ms, encode_document};
use crate::error::{Error, Result};
use crate::patch::CompiledPatch;
use crate::reader::get_document;
use crate::schema::{load_last_etag, store_last_etag};
use crate::types::{DeleteResult, Document, DocumentKey, Etag, PutDocumentCommand, PutResult};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Commands are collected for up to this duration before being executed.
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum commands per batch.
///
/// If this many commands accumulate before the timeout, execute immediately.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Size of the command channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for commands before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum commands per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Merged Commands
// =============================================================================

/// A unit of work executed by the writer inside a write transaction.
///
/// `execute` runs on the writer thread, inside its own SAVEPOINT. Returning
/// an error rolls back everything the command wrote; other commands in the
/// same physical transaction are unaffected. The writer never retries.
pub trait MergedCommand: Send + 'static {
    /// Value returned to the submitter alongside the command.
    type Output: Send + 'static;

    /// Applies the command's writes.
    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> Result<Self::Output>;
}

/// A command handed back after its transaction committed.
pub struct Executed<C: MergedCommand> {
    /// The command itself, in the state `execute` left it.
    pub command: C,
    /// What `execute` returned.
    pub output: C::Output,
}

/// Type-erased form of a submitted command, so one batch can hold commands
/// of different types.
trait ErasedCommand: Send {
    /// Runs the command. Returns `true` if its writes should be kept.
    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> bool;

    /// Answers the submitter once the batch's fate is known.
    fn complete(self: Box<Self>, commit: std::result::Result<(), String>);
}

struct Submission<C: MergedCommand> {
    command: C,
    outcome: Option<Result<C::Output>>,
    response: oneshot::Sender<Result<Executed<C>>>,
}

impl<C: MergedCommand> ErasedCommand for Submission<C> {
    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> bool {
        let outcome = self.command.execute(tx);
        let applied = outcome.is_ok();
        self.outcome = Some(outcome);
        applied
    }

    fn complete(self: Box<Self>, commit: std::result::Result<(), String>) {
        let Submission {
            command,
            outcome,
            response,
        } = *self;

        let result = match (commit, outcome) {
            (Err(msg), _) => Err(Error::Schema(msg)),
            (Ok(()), Some(Ok(output))) => Ok(Executed { command, output }),
            (Ok(()), Some(Err(e))) => Err(e),
            (Ok(()), None) => Err(Error::WriterUnavailable(
                "command was not executed".to_string(),
            )),
        };

        let _ = response.send(result);
    }
}

/// A write request sent to the batch writer.
enum WriteRequest {
    /// A command to run in the next batch.
    Merged(Box<dyn ErasedCommand>),

    /// Flush the pending batch and stop. Acknowledged once the thread is done
    /// writing.
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// Write Transaction
// =============================================================================

/// Outcome of patching a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The document changed and was stamped with a new etag.
    Patched(Etag),
    /// The script left the document as it was; nothing was written.
    NotModified,
    /// No document with that key exists.
    DocumentDoesNotExist,
}

/// The view of the database a [`MergedCommand`] writes through.
///
/// Only exists on the writer thread, inside an open transaction.
pub struct WriteTransaction<'a> {
    conn: &'a Connection,
    last_etag: &'a mut Etag,
}

impl WriteTransaction<'_> {
    /// Loads a document, seeing earlier writes of the same transaction.
    pub fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        get_document(self.conn, key)
    }

    /// Returns a document's current etag without decoding its body.
    pub fn current_etag(&self, key: &DocumentKey) -> Result<Option<Etag>> {
        let etag: Option<i64> = self
            .conn
            .query_row(
                "SELECT etag FROM documents WHERE key = ?",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(etag.map(|e| Etag::from_raw(e as u64)))
    }

    /// Inserts or replaces a document.
    ///
    /// With `expected_etag` set, fails with `ConcurrencyConflict` unless the
    /// document's current etag matches. `Etag::ZERO` means "must not exist".
    /// Bodies that are not JSON objects fail with `InvalidDocument`.
    pub fn put(&mut self, command: &PutDocumentCommand) -> Result<PutResult> {
        if !command.data.is_object() {
            return Err(Error::InvalidDocument {
                key: command.key.as_str().to_string(),
                reason: format!("body must be a JSON object, got {}", json_kind(&command.data)),
            });
        }

        let current = self.current_etag(&command.key)?;
        check_expected(&command.key, command.expected_etag, current)?;

        let (data, checksum) = encode_document(&command.data)?;
        let etag = self.allocate_etag();

        self.conn.execute(
            "INSERT INTO documents (key, collection, etag, last_modified_ms, checksum, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 collection = excluded.collection,
                 etag = excluded.etag,
                 last_modified_ms = excluded.last_modified_ms,
                 checksum = excluded.checksum,
                 data = excluded.data",
            params![
                command.key.as_str(),
                command.collection.as_str(),
                etag.as_raw() as i64,
                current_time_ms() as i64,
                checksum,
                data,
            ],
        )?;

        Ok(PutResult {
            key: command.key.clone(),
            etag,
        })
    }

    /// Deletes a document. Returns the etag it had, or `None` if it did not
    /// exist.
    pub fn delete(&mut self, key: &DocumentKey, expected_etag: Option<Etag>) -> Result<Option<Etag>> {
        let current = self.current_etag(key)?;
        check_expected(key, expected_etag, current)?;

        if current.is_some() {
            self.conn
                .execute("DELETE FROM documents WHERE key = ?", params![key.as_str()])?;
        }

        Ok(current)
    }

    /// Applies a compiled patch to one document.
    ///
    /// With `expected_etag` set, fails with `ConcurrencyConflict` if the
    /// document was re-etagged since the caller last saw it.
    pub fn patch(
        &mut self,
        key: &DocumentKey,
        patch: &CompiledPatch,
        expected_etag: Option<Etag>,
    ) -> Result<PatchOutcome> {
        let Some(document) = self.get(key)? else {
            return Ok(PatchOutcome::DocumentDoesNotExist);
        };
        check_expected(key, expected_etag, Some(document.etag))?;

        let mut body = document.data;
        if !patch.apply(&mut body)? {
            return Ok(PatchOutcome::NotModified);
        }

        let (data, checksum) = encode_document(&body)?;
        let etag = self.allocate_etag();

        self.conn.execute(
            "UPDATE documents SET etag = ?, last_modified_ms = ?, checksum = ?, data = ?
             WHERE key = ?",
            params![
                etag.as_raw() as i64,
                current_time_ms() as i64,
                checksum,
                data,
                key.as_str(),
            ],
        )?;

        Ok(PatchOutcome::Patched(etag))
    }

    fn allocate_etag(&mut self) -> Etag {
        *self.last_etag = self.last_etag.next();
        *self.last_etag
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn check_expected(key: &DocumentKey, expected: Option<Etag>, current: Option<Etag>) -> Result<()> {
    match expected {
        Some(expected) => {
            let actual = current.unwrap_or(Etag::ZERO);
            if actual != expected {
                return Err(Error::ConcurrencyConflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
            Ok(())
        }
        None => Ok(()),
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The batch writer that handles group commit.
///
/// This is the internal implementation that runs on a dedicated thread.
/// Use [`BatchWriterHandle`] to interact with it from async code.
pub struct BatchWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,

    /// Last etag handed out by a committed transaction (mirrors disk).
    last_etag_committed: Etag,
}

impl BatchWriter {
    /// Creates a new batch writer. The schema must be initialized.
    pub fn new(conn: Connection) -> Result<Self> {
        let last_etag_committed = Etag::from_raw(load_last_etag(&conn)?);

        Ok(Self {
            conn,
            last_etag_committed,
        })
    }

    /// Last etag handed out by a committed transaction.
    pub fn last_etag(&self) -> Etag {
        self.last_etag_committed
    }

    /// Executes a batch of commands in one physical transaction and answers
    /// every submitter.
    fn execute_batch(&mut self, mut items: Vec<Box<dyn ErasedCommand>>) {
        if items.is_empty() {
            return;
        }

        let started = Instant::now();
        let mut staged = self.last_etag_committed;

        match self.execute_batch_inner(&mut items, &mut staged) {
            Ok(()) => {
                self.last_etag_committed = staged;
                debug!(
                    commands = items.len(),
                    last_etag = %staged,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "batch committed"
                );

                for item in items {
                    item.complete(Ok(()));
                }
            }
            Err(e) => {
                warn!(commands = items.len(), error = %e, "batch commit failed");
                let err_msg = format!("batch commit failed: {}", e);

                for item in items {
                    item.complete(Err(err_msg.clone()));
                }
            }
        }
    }

    fn execute_batch_inner(
        &mut self,
        items: &mut [Box<dyn ErasedCommand>],
        last_etag: &mut Etag,
    ) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = items
            .iter_mut()
            .enumerate()
            .try_for_each(|(index, item)| {
                execute_in_savepoint(&self.conn, item.as_mut(), index, last_etag)
            })
            .and_then(|()| store_last_etag(&self.conn, last_etag.as_raw()))
            .and_then(|()| self.conn.execute_batch("COMMIT").map_err(Error::from));

        if result.is_err() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
        result
    }
}

/// Executes a single command within a SAVEPOINT.
///
/// A failing command is not an error here: its savepoint is rolled back and
/// its etags given back. Only failures of the savepoint statements
/// themselves abort the batch.
fn execute_in_savepoint(
    conn: &Connection,
    item: &mut dyn ErasedCommand,
    index: usize,
    last_etag: &mut Etag,
) -> Result<()> {
    let sp_name = format!("cmd_{}", index);
    conn.execute_batch(&format!("SAVEPOINT {}", sp_name))?;

    let before = *last_etag;
    let applied = {
        let mut tx = WriteTransaction { conn, last_etag };
        item.execute(&mut tx)
    };

    if applied {
        conn.execute_batch(&format!("RELEASE {}", sp_name))?;
    } else {
        *last_etag = before;
        conn.execute_batch(&format!("ROLLBACK TO {}", sp_name))?;
        conn.execute_batch(&format!("RELEASE {}", sp_name))?;
    }

    Ok(())
}

// =============================================================================
// Built-in Commands
// =============================================================================

struct PutDocument(PutDocumentCommand);

impl MergedCommand for PutDocument {
    type Output = PutResult;

    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> Result<PutResult> {
        tx.put(&self.0)
    }
}

struct DeleteDocument {
    key: DocumentKey,
    expected_etag: Option<Etag>,
}

impl MergedCommand for DeleteDocument {
    type Output = DeleteResult;

    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> Result<DeleteResult> {
        let deleted_etag = tx.delete(&self.key, self.expected_etag)?;
        Ok(DeleteResult {
            key: self.key.clone(),
            deleted_etag,
        })
    }
}

// =============================================================================
// Batch Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the batch writer.
///
/// This is the public interface for submitting commands. It sends requests
/// to the writer thread and awaits responses.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatchWriterHandle {
    /// Submits a command and waits until the transaction it ran in has
    /// committed.
    ///
    /// Waits for channel capacity when the writer is busy; never rejects.
    pub async fn enqueue<C: MergedCommand>(&self, command: C) -> Result<Executed<C>> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest::Merged(Box::new(Submission {
                command,
                outcome: None,
                response: response_tx,
            })))
            .await
            .map_err(|_| Error::WriterUnavailable("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::WriterUnavailable("writer dropped response".to_string()))?
    }

    /// Inserts or replaces a document.
    pub async fn put(&self, command: PutDocumentCommand) -> Result<PutResult> {
        Ok(self.enqueue(PutDocument(command)).await?.output)
    }

    /// Deletes a document, optionally checking its etag first.
    pub async fn delete(
        &self,
        key: impl Into<DocumentKey>,
        expected_etag: Option<Etag>,
    ) -> Result<DeleteResult> {
        let command = DeleteDocument {
            key: key.into(),
            expected_etag,
        };
        Ok(self.enqueue(command).await?.output)
    }

    /// Flushes pending commands and stops the writer.
    ///
    /// Commands enqueued afterwards fail with `WriterUnavailable`.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the batch writer loop.
///
/// This function runs on a dedicated thread, collecting commands and
/// executing them in batches.
async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<Box<dyn ErasedCommand>> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let wait_timeout = match batch_start {
            // No pending commands - wait indefinitely
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::Merged(command))) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }

                batch.push(command);

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                    batch_start = None;
                }
            }
            Ok(Some(WriteRequest::Shutdown(done))) => {
                writer.execute_batch(std::mem::take(&mut batch));
                debug!(last_etag = %writer.last_etag(), "batch writer stopped");
                let _ = done.send(());
                break;
            }
            Ok(None) => {
                // Channel closed
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                // Timeout - execute current batch
                writer.execute_batch(std::mem::take(&mut batch));
                batch_start = None;
            }
        }
    }
}

/// Spawns the batch writer on a dedicated thread.
///
/// Returns a handle for submitting commands and the thread's join handle.
pub fn spawn_batch_writer(
    conn: Connection,
    config: WriterConfig,
) -> Result<(BatchWriterHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let writer = BatchWriter::new(conn)?;

    let thread = std::thread::Builder::new()
        .name("spitedocs-batch-writer".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create writer runtime");

            rt.block_on(run_batch_writer(writer, rx, config));
        })
        .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {}", e)))?;

    Ok((BatchWriterHandle { tx }, thread))
}

// =============================================================================
// Tests
// =============================================================================
