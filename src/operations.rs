//! # Long-Running Operations
//!
//! Bulk jobs can take minutes. [`Operations`] runs them as background tasks
//! and keeps an observable record of each one: its status, its latest
//! progress, and its result or failure. A running operation can be killed,
//! which fires its cancel token; the job stops at its next cancellation
//! check.
//!
//! ```text
//!             spawn                   progress callback
//!  caller ──────────────▶ task ───────────────────────────┐
//!    │                     │                              ▼
//!    │  kill(id) ─────▶ cancel token         watch::Sender<OperationState>
//!    │                                                    │
//!    └── state(id) / wait(id) ◀──────── watch::Receiver ◀─┘
//! ```
//!
//! Finished records are kept for a retention period
//! ([`DEFAULT_OPERATION_RETENTION`] unless configured otherwise) and then
//! dropped. Callers that are done with a record earlier can
//! [`Operations::forget`] it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::OperationCancelToken;
use crate::error::{Error, Result};
use crate::runner::{BulkOperationResult, DeterminateProgress};

/// How long a finished operation stays queryable.
pub const DEFAULT_OPERATION_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Identifies an operation within one [`Operations`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Completed,
    Faulted,
    Canceled,
}

/// Snapshot of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub status: OperationStatus,
    /// Latest progress reported by the job.
    pub progress: Option<DeterminateProgress>,
    /// Set once the operation completed.
    pub result: Option<BulkOperationResult>,
    /// Set once the operation faulted or was canceled.
    pub error: Option<String>,
}

impl OperationState {
    fn in_progress() -> Self {
        Self {
            status: OperationStatus::InProgress,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != OperationStatus::InProgress
    }
}

struct TrackedOperation {
    description: String,
    token: OperationCancelToken,
    state: watch::Sender<OperationState>,
}

/// Feeds a job's progress callback into its operation record.
#[derive(Clone)]
pub struct ProgressReporter {
    operation: Arc<TrackedOperation>,
}

impl ProgressReporter {
    pub fn report(&self, progress: DeterminateProgress) {
        self.operation
            .state
            .send_modify(|state| state.progress = Some(progress));
    }
}

/// Registry of long-running operations.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Operations {
    inner: Arc<OperationsInner>,
}

struct OperationsInner {
    last_id: AtomicU64,
    retention: Duration,
    operations: Mutex<HashMap<OperationId, Arc<TrackedOperation>>>,
}

impl Default for Operations {
    fn default() -> Self {
        Self::with_retention(DEFAULT_OPERATION_RETENTION)
    }
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that drops finished records after `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Arc::new(OperationsInner {
                last_id: AtomicU64::new(0),
                retention,
                operations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts `task` in the background and returns its id.
    ///
    /// `token` must be the token the task checks; [`Operations::kill`] fires
    /// it. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(
        &self,
        description: impl Into<String>,
        token: OperationCancelToken,
        task: F,
    ) -> OperationId
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<BulkOperationResult>> + Send + 'static,
    {
        let id = OperationId(self.inner.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (state, _) = watch::channel(OperationState::in_progress());
        let operation = Arc::new(TrackedOperation {
            description: description.into(),
            token,
            state,
        });

        self.inner.operations.lock().insert(id, Arc::clone(&operation));

        let job = task(ProgressReporter {
            operation: Arc::clone(&operation),
        });

        info!(operation = %id, description = %operation.description, "operation started");

        let registry = Arc::downgrade(&self.inner);
        let retention = self.inner.retention;

        tokio::spawn(async move {
            let outcome = job.await;

            match &outcome {
                Ok(result) => {
                    info!(operation = %id, processed = result.total, "operation completed")
                }
                Err(Error::Canceled) => info!(operation = %id, "operation canceled"),
                Err(e) => warn!(operation = %id, error = %e, "operation faulted"),
            }

            operation.state.send_modify(|state| match outcome {
                Ok(result) => {
                    state.status = OperationStatus::Completed;
                    state.result = Some(result);
                }
                Err(Error::Canceled) => {
                    state.status = OperationStatus::Canceled;
                    state.error = Some(Error::Canceled.to_string());
                }
                Err(e) => {
                    state.status = OperationStatus::Faulted;
                    state.error = Some(e.to_string());
                }
            });

            tokio::time::sleep(retention).await;
            expire(&registry, id);
        });

        id
    }

    fn get(&self, id: OperationId) -> Option<Arc<TrackedOperation>> {
        self.inner.operations.lock().get(&id).cloned()
    }

    /// Returns the current state of an operation.
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.get(id).map(|op| op.state.borrow().clone())
    }

    /// Returns the operation's description.
    pub fn description(&self, id: OperationId) -> Option<String> {
        self.get(id).map(|op| op.description.clone())
    }

    /// Subscribes to state changes of an operation.
    pub fn subscribe(&self, id: OperationId) -> Option<watch::Receiver<OperationState>> {
        self.get(id).map(|op| op.state.subscribe())
    }

    /// Waits until an operation finishes and returns its final state.
    pub async fn wait(&self, id: OperationId) -> Option<OperationState> {
        let mut rx = self.subscribe(id)?;
        let state = rx.wait_for(OperationState::is_finished).await.ok()?;
        Some(state.clone())
    }

    /// Cancels a running operation. Returns false if it is unknown or already
    /// finished.
    pub fn kill(&self, id: OperationId) -> bool {
        match self.get(id) {
            Some(op) if !op.state.borrow().is_finished() => {
                info!(operation = %id, "killing operation");
                op.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Ids of all known operations, oldest first.
    pub fn ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.inner.operations.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drops the record of a finished operation.
    pub fn forget(&self, id: OperationId) -> bool {
        let mut operations = self.inner.operations.lock();
        match operations.get(&id) {
            Some(op) if op.state.borrow().is_finished() => {
                operations.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// Drops a finished record once its retention elapsed, unless the registry
/// itself is gone.
fn expire(registry: &Weak<OperationsInner>, id: OperationId) {
    if let Some(inner) = registry.upgrade() {
        if inner.operations.lock().remove(&id).is_some() {
            debug!(operation = %id, "operation record expired");
        }
    }
}
