//! # Etag Cursor
//!
//! Walks one collection in ascending etag order, a batch at a time, within a
//! [`ScopeBound`] fixed when the job started.
//!
//! ```text
//!  collection "Orders", scope high water = 9
//!
//!   etag:   5      7      9  │  12 (re-etagged by the job)   14 (new)
//!           ●──────●──────●  │  ○                            ○
//!           └── visited ──┘  │  └──── above high water, never visited
//! ```
//!
//! Each call to [`EtagCursor::next_batch`] is its own short read, starting
//! strictly after the last etag handed out, so no read snapshot is held
//! while the batch is being written. Documents the job itself touches are
//! re-etagged above the high water and fall out of scope.

use tracing::trace;

use crate::cancel::OperationCancelToken;
use crate::error::Result;
use crate::reader::ReaderHandle;
use crate::types::{CollectionName, DocumentRef, Etag, ScopeBound};

/// One batch of in-scope documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanBatch {
    /// Documents in ascending etag order, all at or below the high water.
    pub documents: Vec<DocumentRef>,
    /// A document above the high water was seen; nothing further is in scope.
    pub end_of_scope: bool,
}

impl ScanBatch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Bounded, restartable scan over a collection.
#[derive(Debug, Clone)]
pub struct EtagCursor {
    collection: CollectionName,
    scope: ScopeBound,
    /// Exclusive lower bound of the next scan.
    position: Etag,
    batch_size: usize,
    exhausted: bool,
}

impl EtagCursor {
    pub fn new(collection: CollectionName, scope: ScopeBound, batch_size: usize) -> Self {
        Self {
            collection,
            scope,
            position: Etag::ZERO,
            batch_size: batch_size.max(1),
            exhausted: scope.is_empty(),
        }
    }

    pub fn scope(&self) -> ScopeBound {
        self.scope
    }

    /// The last etag handed out, [`Etag::ZERO`] before the first batch.
    pub fn position(&self) -> Etag {
        self.position
    }

    /// True once no further batch can contain in-scope documents.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted || self.position >= self.scope.high_water
    }

    /// Reads the next batch.
    ///
    /// Returns an empty batch once the cursor is exhausted.
    pub async fn next_batch(
        &mut self,
        reader: &ReaderHandle,
        token: &OperationCancelToken,
    ) -> Result<ScanBatch> {
        if self.is_exhausted() {
            return Ok(ScanBatch::default());
        }

        let scanned = reader
            .scan_collection(self.collection.clone(), self.position, self.batch_size)
            .await?;

        Ok(self.absorb(scanned, token))
    }

    /// Applies the high-water filter to scanned documents and advances past
    /// the ones kept.
    fn absorb(&mut self, scanned: Vec<DocumentRef>, token: &OperationCancelToken) -> ScanBatch {
        let mut batch = ScanBatch {
            documents: Vec::with_capacity(scanned.len()),
            end_of_scope: false,
        };

        for document in scanned {
            if document.etag > self.scope.high_water {
                batch.end_of_scope = true;
                break;
            }

            self.position = document.etag;
            token.delay();
            batch.documents.push(document);
        }

        if batch.end_of_scope || batch.is_empty() {
            self.exhausted = true;
        }

        trace!(
            collection = %self.collection,
            documents = batch.len(),
            position = %self.position,
            end_of_scope = batch.end_of_scope,
            "scanned batch"
        );

        batch
    }
}
