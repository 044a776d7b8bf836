//! # Bulk Command
//!
//! The merged command a bulk job hands to the writer. It owns one batch of
//! scanned documents and drains them, one key at a time, inside the writer's
//! transaction.
//!
//! A command stops early when the job's rate gate has no permit left, and
//! reports it through [`BulkCommand::needs_wait`]. The writer hands the
//! command back after committing what was drained so far; the job waits on
//! the gate and resubmits the same command, which picks up where it left off.
//!
//! ```text
//!  pending: [k1 k2 k3 k4 k5]
//!            ──────▲
//!                  position (k1, k2 committed; gate empty; needs_wait)
//! ```

use std::sync::Arc;

use crate::cancel::OperationCancelToken;
use crate::error::Result;
use crate::patch::CompiledPatch;
use crate::rate_gate::RateGate;
use crate::types::DocumentRef;
use crate::writer::{MergedCommand, PatchOutcome, WriteTransaction};

/// What a bulk job does to every document.
#[derive(Debug, Clone)]
pub enum CollectionAction {
    /// Delete the document. Documents already gone are skipped.
    Delete,
    /// Apply a compiled patch. Documents already gone are skipped.
    Patch(CompiledPatch),
}

impl CollectionAction {
    pub fn name(&self) -> &'static str {
        match self {
            CollectionAction::Delete => "delete",
            CollectionAction::Patch(_) => "patch",
        }
    }
}

/// What one execution of a [`BulkCommand`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkCommandStats {
    /// Keys consumed in this execution.
    pub consumed: usize,
    /// Consumed keys whose document no longer existed or was left unchanged.
    pub skipped: usize,
}

/// A batch of keys to apply a [`CollectionAction`] to.
pub struct BulkCommand {
    pending: Vec<DocumentRef>,
    position: usize,
    action: Arc<CollectionAction>,
    gate: Option<Arc<RateGate>>,
    token: OperationCancelToken,
    needs_wait: bool,
    holds_permit: bool,
}

impl BulkCommand {
    pub fn new(
        pending: Vec<DocumentRef>,
        action: Arc<CollectionAction>,
        gate: Option<Arc<RateGate>>,
        token: OperationCancelToken,
    ) -> Self {
        Self {
            pending,
            position: 0,
            action,
            gate,
            token,
            needs_wait: false,
            holds_permit: false,
        }
    }

    /// Keys not yet consumed.
    pub fn remaining(&self) -> &[DocumentRef] {
        &self.pending[self.position..]
    }

    /// Keys consumed by all executions so far.
    pub fn consumed(&self) -> usize {
        self.position
    }

    pub fn is_drained(&self) -> bool {
        self.position >= self.pending.len()
    }

    /// True if the last execution stopped because the rate gate was empty.
    pub fn needs_wait(&self) -> bool {
        self.needs_wait
    }

    /// Hands the command a permit acquired outside the writer. The next
    /// execution spends it on its first key instead of asking the gate.
    pub fn grant_permit(&mut self) {
        self.holds_permit = true;
    }

    fn take_permit(&mut self) -> bool {
        match &self.gate {
            None => true,
            Some(_) if self.holds_permit => {
                self.holds_permit = false;
                true
            }
            Some(gate) => gate.try_acquire(),
        }
    }
}

impl MergedCommand for BulkCommand {
    type Output = BulkCommandStats;

    fn execute(&mut self, tx: &mut WriteTransaction<'_>) -> Result<BulkCommandStats> {
        let mut stats = BulkCommandStats::default();
        self.needs_wait = false;

        while self.position < self.pending.len() {
            self.token.check()?;
            self.token.delay();

            if !self.take_permit() {
                self.needs_wait = true;
                break;
            }

            let document = &self.pending[self.position];
            let applied = match &*self.action {
                CollectionAction::Delete => tx.delete(&document.key, None)?.is_some(),
                CollectionAction::Patch(patch) => matches!(
                    tx.patch(&document.key, patch, Some(document.etag))?,
                    PatchOutcome::Patched(_)
                ),
            };

            self.position += 1;
            stats.consumed += 1;
            if !applied {
                stats.skipped += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::schema::Database;
    use crate::types::{DocumentKey, Etag, PutDocumentCommand};
    use crate::writer::{spawn_batch_writer, BatchWriterHandle, WriterConfig};
    use crate::patch::PatchRequest;
    use serde_json::json;
    use std::time::Duration;

    async fn seeded(count: u64) -> (BatchWriterHandle, Vec<DocumentRef>) {
        let db = Database::open_in_memory().unwrap();
        let (handle, _thread) = spawn_batch_writer(db.into_connection(), WriterConfig::default()).unwrap();

        let mut refs = Vec::new();
        for i in 0..count {
            let key = format!("orders/{i}");
            let put = handle
                .put(PutDocumentCommand::new(key.as_str(), "Orders", json!({"n": i})))
                .await
                .unwrap();
            refs.push(DocumentRef::new(key, put.etag));
        }
        (handle, refs)
    }

    #[tokio::test]
    async fn test_drains_all_keys_without_gate() {
        let (handle, refs) = seeded(5).await;
        let command = BulkCommand::new(
            refs,
            Arc::new(CollectionAction::Delete),
            None,
            OperationCancelToken::new(),
        );

        let executed = handle.enqueue(command).await.unwrap();
        assert!(executed.command.is_drained());
        assert!(!executed.command.needs_wait());
        assert_eq!(executed.output.consumed, 5);
        assert_eq!(executed.output.skipped, 0);
    }

    #[tokio::test]
    async fn test_missing_documents_are_skipped() {
        let (handle, mut refs) = seeded(2).await;
        refs.push(DocumentRef::new("orders/gone", Etag::from_raw(50)));

        for action in [
            CollectionAction::Delete,
            CollectionAction::Patch(PatchRequest::new("this.n = 0").compile().unwrap()),
        ] {
            let command = BulkCommand::new(
                refs.clone(),
                Arc::new(action),
                None,
                OperationCancelToken::new(),
            );
            let executed = handle.enqueue(command).await.unwrap();
            assert!(executed.command.is_drained());
            assert!(executed.output.skipped >= 1);
        }
    }

    /// With a gate of 2 permits per hour, the command stops after two keys and
    /// a granted permit lets it consume exactly one more.
    #[tokio::test]
    async fn test_stops_when_gate_is_empty() {
        let (handle, refs) = seeded(4).await;
        let gate = Arc::new(RateGate::new(2, Duration::from_secs(3600)).unwrap());
        let command = BulkCommand::new(
            refs,
            Arc::new(CollectionAction::Delete),
            Some(gate),
            OperationCancelToken::new(),
        );

        let executed = handle.enqueue(command).await.unwrap();
        let mut command = executed.command;
        assert_eq!(executed.output.consumed, 2);
        assert!(command.needs_wait());
        assert_eq!(command.remaining().len(), 2);

        command.grant_permit();
        let executed = handle.enqueue(command).await.unwrap();
        assert_eq!(executed.output.consumed, 1);
        assert!(executed.command.needs_wait());
        assert_eq!(executed.command.consumed(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_command_rolls_back() {
        let (handle, refs) = seeded(3).await;
        let token = OperationCancelToken::new();
        token.cancel();

        let command = BulkCommand::new(
            refs,
            Arc::new(CollectionAction::Delete),
            None,
            token,
        );
        let err = handle.enqueue(command).await.err().unwrap();
        assert!(matches!(err, Error::Canceled));

        let still_there = handle.delete("orders/0", None).await.unwrap();
        assert!(still_there.deleted_etag.is_some());
    }

    #[tokio::test]
    async fn test_patch_conflict_when_document_changed() {
        let (handle, refs) = seeded(1).await;
        handle
            .put(PutDocumentCommand::new("orders/0", "Orders", json!({"n": 42})))
            .await
            .unwrap();

        let patch = PatchRequest::new("this.seen = true").compile().unwrap();
        let command = BulkCommand::new(
            refs,
            Arc::new(CollectionAction::Patch(patch)),
            None,
            OperationCancelToken::new(),
        );

        let err = handle.enqueue(command).await.err().unwrap();
        match err {
            Error::ConcurrencyConflict { key, expected, actual } => {
                assert_eq!(DocumentKey::new(key), DocumentKey::new("orders/0"));
                assert_eq!(expected, Etag::FIRST);
                assert_eq!(actual, Etag::from_raw(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
