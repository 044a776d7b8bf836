//! # Operation Cancellation
//!
//! Bulk operations are canceled cooperatively. An [`OperationCancelToken`] is
//! threaded through every call boundary of a job and polled at each loop head:
//! before every read snapshot, before every document inside a merged command,
//! and while waiting on the rate gate. Nothing is ever interrupted mid-write;
//! a merged command that sees the token stops and its savepoint is rolled
//! back, while batches committed earlier stay committed.
//!
//! ## Inactivity Timeout
//!
//! A token may carry a timeout. It is not a deadline for the whole job: every
//! call to [`OperationCancelToken::delay`] pushes it back. Jobs call `delay`
//! as they make progress, so a long but moving job runs to completion, and a
//! job stuck behind a blocked writer cancels itself.
//!
//! Once a token has fired (explicitly or by timeout) it stays fired.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Cancellation signal for one bulk operation.
///
/// Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct OperationCancelToken {
    token: CancellationToken,
    timeout: Option<Duration>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl OperationCancelToken {
    /// Creates a token that only fires when canceled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that also fires after `timeout` without progress.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout: Some(timeout),
            deadline: Arc::new(Mutex::new(Some(Instant::now() + timeout))),
        }
    }

    /// Creates a token that also fires when `parent` fires, e.g. a database
    /// shutdown token.
    ///
    /// Canceling this token, or letting its timeout elapse, never fires
    /// `parent`.
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            timeout,
            deadline: Arc::new(Mutex::new(timeout.map(|t| Instant::now() + t))),
        }
    }

    /// Fires the token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the token has fired.
    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }

        let timed_out = matches!(*self.deadline.lock(), Some(deadline) if Instant::now() >= deadline);
        if timed_out {
            tracing::debug!(timeout = ?self.timeout, "operation timed out without progress");
            self.token.cancel();
        }
        timed_out
    }

    /// Returns `Err(Error::Canceled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Postpones the inactivity timeout. No-op for tokens without one.
    pub fn delay(&self) {
        if let Some(timeout) = self.timeout {
            *self.deadline.lock() = Some(Instant::now() + timeout);
        }
    }

    /// Completes once the token fires.
    pub async fn cancelled(&self) {
        loop {
            let deadline = *self.deadline.lock();
            match deadline {
                None => return self.token.cancelled().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => {
                            // The deadline may have moved while we slept.
                            if self.is_cancelled() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
