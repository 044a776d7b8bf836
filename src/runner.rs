//! # Collection Runner
//!
//! Applies an action (delete or patch) to every document of one collection.
//!
//! ## Algorithm
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────────┐
//!  │ 1. read scope { high water etag, document count }  (one snapshot)│
//!  │ 2. progress { total, processed: 0 }                              │
//!  │ 3. loop:                                                         │
//!  │      scan next batch (≤ batch_size, etag ≤ high water)           │
//!  │      ┌─▶ enqueue BulkCommand ──▶ writer commits ──┐              │
//!  │      │                                            │              │
//!  │      └── wait on rate gate ◀── needs_wait ────────┘              │
//!  │      progress.processed += batch length                          │
//!  │ 4. result { total: processed }                                   │
//!  └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scope
//!
//! The scope is every document that existed when the job started. Documents
//! written afterwards, including the ones the job itself patches, get etags
//! above the high water and are never visited. Documents deleted by someone
//! else before the job reaches them are skipped.
//!
//! ## Progress
//!
//! `processed` counts documents handed to the writer in committed batches,
//! whether or not each one still existed at that point. It is reported once
//! before any write and once per batch.
//!
//! ## Failure
//!
//! Any error (cancellation, conflict, storage) stops the job immediately.
//! Batches committed before the failure stay committed and the last reported
//! progress stands. Nothing is retried.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bulk_command::{BulkCommand, BulkCommandStats, CollectionAction};
use crate::cancel::OperationCancelToken;
use crate::cursor::EtagCursor;
use crate::error::{Error, Result};
use crate::patch::PatchRequest;
use crate::rate_gate::RateGate;
use crate::reader::ReaderHandle;
use crate::types::CollectionName;
use crate::writer::BatchWriterHandle;

// =============================================================================
// Configuration
// =============================================================================

/// Documents scanned and submitted per batch.
pub const DEFAULT_BULK_BATCH_SIZE: usize = 1024;

/// Configuration for the collection runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum documents per scan and per merged command.
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BULK_BATCH_SIZE,
        }
    }
}

// =============================================================================
// Job Types
// =============================================================================

/// Per-job options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOperationOptions {
    /// Throttle to this many documents per second. `None` runs unthrottled.
    pub max_ops_per_second: Option<u32>,
}

impl CollectionOperationOptions {
    pub fn throttled(max_ops_per_second: u32) -> Self {
        Self {
            max_ops_per_second: Some(max_ops_per_second),
        }
    }

    /// Builds the job's private rate gate, if throttled.
    fn rate_gate(&self) -> Result<Option<Arc<RateGate>>> {
        match self.max_ops_per_second {
            None => Ok(None),
            Some(0) => Err(Error::InvalidConfiguration(
                "max_ops_per_second must be positive".to_string(),
            )),
            Some(ops) => Ok(Some(Arc::new(RateGate::per_second(ops)?))),
        }
    }
}

/// Progress of a job with a known total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminateProgress {
    pub total: u64,
    pub processed: u64,
}

/// Result of a completed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    /// Documents processed.
    pub total: u64,
}

// =============================================================================
// Collection Runner
// =============================================================================

/// Runs bulk jobs against one database.
///
/// Cheap to clone; every clone shares the same reader pool and writer.
#[derive(Clone)]
pub struct CollectionRunner {
    reader: ReaderHandle,
    writer: BatchWriterHandle,
    config: RunnerConfig,
}

impl CollectionRunner {
    pub fn new(reader: ReaderHandle, writer: BatchWriterHandle, config: RunnerConfig) -> Self {
        Self {
            reader,
            writer,
            config,
        }
    }

    /// Deletes every document of a collection.
    pub async fn execute_delete(
        &self,
        collection: &CollectionName,
        options: CollectionOperationOptions,
        on_progress: impl FnMut(DeterminateProgress) + Send,
        token: &OperationCancelToken,
    ) -> Result<BulkOperationResult> {
        self.execute_operation(collection, options, CollectionAction::Delete, on_progress, token)
            .await
    }

    /// Patches every document of a collection.
    ///
    /// The script is compiled before anything is read, so an invalid script
    /// fails with `InvalidPatch` without touching the collection.
    pub async fn execute_patch(
        &self,
        collection: &CollectionName,
        options: CollectionOperationOptions,
        patch: &PatchRequest,
        on_progress: impl FnMut(DeterminateProgress) + Send,
        token: &OperationCancelToken,
    ) -> Result<BulkOperationResult> {
        let compiled = patch.compile()?;
        self.execute_operation(
            collection,
            options,
            CollectionAction::Patch(compiled),
            on_progress,
            token,
        )
        .await
    }

    /// Applies `action` to every document of a collection.
    pub async fn execute_operation(
        &self,
        collection: &CollectionName,
        options: CollectionOperationOptions,
        action: CollectionAction,
        mut on_progress: impl FnMut(DeterminateProgress) + Send,
        token: &OperationCancelToken,
    ) -> Result<BulkOperationResult> {
        let gate = options.rate_gate()?;
        let started = Instant::now();

        token.check()?;
        let scope = self.reader.collection_scope(collection.clone()).await?;

        let mut progress = DeterminateProgress {
            total: scope.total_count,
            processed: 0,
        };
        on_progress(progress);

        info!(
            %collection,
            action = action.name(),
            total = scope.total_count,
            high_water = %scope.high_water,
            max_ops_per_second = ?options.max_ops_per_second,
            "collection operation started"
        );

        let action = Arc::new(action);
        let mut cursor = EtagCursor::new(collection.clone(), scope, self.config.batch_size);

        while !cursor.is_exhausted() {
            token.check()?;

            let batch = cursor.next_batch(&self.reader, token).await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len() as u64;

            let command =
                BulkCommand::new(batch.documents, Arc::clone(&action), gate.clone(), token.clone());
            let stats = submit_batch(&self.writer, command, gate.as_deref(), token).await?;

            debug!(
                %collection,
                documents = stats.consumed,
                skipped = stats.skipped,
                position = %cursor.position(),
                "bulk batch committed"
            );

            progress.processed += batch_len;
            on_progress(progress);
        }

        info!(
            %collection,
            processed = progress.processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collection operation completed"
        );

        Ok(BulkOperationResult {
            total: progress.processed,
        })
    }
}

/// Hands one batch to the writer, resubmitting it after every rate-gate wait
/// until all of its keys are drained. Returns the stats summed over all
/// submissions.
async fn submit_batch(
    writer: &BatchWriterHandle,
    mut command: BulkCommand,
    gate: Option<&RateGate>,
    token: &OperationCancelToken,
) -> Result<BulkCommandStats> {
    let mut total = BulkCommandStats::default();

    loop {
        let executed = writer.enqueue(command).await?;
        total.consumed += executed.output.consumed;
        total.skipped += executed.output.skipped;
        command = executed.command;

        if command.is_drained() {
            return Ok(total);
        }

        if command.needs_wait() {
            if let Some(gate) = gate {
                wait_for_permit(gate, token).await?;
                command.grant_permit();
            }
        }
    }
}

/// Blocks until the gate grants a permit, or the token fires.
async fn wait_for_permit(gate: &RateGate, token: &OperationCancelToken) -> Result<()> {
    debug!(max_ops_per_second = gate.occurrences(), "rate limit reached, waiting");

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Canceled),
        _ = gate.wait_to_proceed() => Ok(()),
    }
}
