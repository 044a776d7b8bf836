//! # Error Handling for SpiteDocs
//!
//! A single error enum ([`Error`]) covers every failure mode of the store and
//! of the bulk operations that run on top of it. Bulk jobs never catch or retry
//! errors themselves: whatever a merged command or a read fails with is what
//! the caller of the job sees.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Cancellation | `Canceled` | Stop; committed batches stay committed |
//! | Conflict | `ConcurrencyConflict` | Re-run the job or re-read the document |
//! | Storage | `Sqlite`, `Schema`, `Corruption`, `Json`, `WriterUnavailable` | Log and investigate |
//! | Request | `InvalidConfiguration`, `InvalidPatch`, `InvalidDocument` | Fix the request; nothing was written |

use thiserror::Error;

use crate::types::Etag;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteDocs operations.
///
/// # Example
///
/// ```rust,ignore
/// use spitedocs::{Error, Result};
///
/// fn example(db: &DocumentDatabase) -> Result<()> {
///     match db.delete_collection("Orders", options, |_| {}, token).await {
///         Ok(result) => println!("deleted {}", result.total),
///         Err(Error::Canceled) => println!("stopped early"),
///         Err(e) => return Err(e),
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cancellation
    // =========================================================================

    /// The operation was canceled before it finished.
    ///
    /// # When This Happens
    ///
    /// - The caller canceled the job's [`OperationCancelToken`](crate::cancel::OperationCancelToken)
    /// - The job was killed through the operations registry
    /// - The operation timeout elapsed without any progress
    ///
    /// # Recovery
    ///
    /// Batches committed before the cancellation remain committed. Re-running
    /// the job recomputes its scope from scratch.
    #[error("operation was canceled")]
    Canceled,

    // =========================================================================
    // Conflict Errors
    // =========================================================================

    /// Optimistic concurrency conflict: the document changed since it was read.
    ///
    /// # When This Happens
    ///
    /// - A bulk patch reaches a document whose etag no longer matches the etag
    ///   seen when the collection was scanned (another writer got there first)
    /// - A put or delete supplied an expected etag that is no longer current
    ///
    /// `actual` is [`Etag::ZERO`] when the document no longer exists.
    #[error("concurrency conflict on document '{key}': expected etag {expected}, but found {actual}")]
    ConcurrencyConflict {
        /// Key of the conflicting document
        key: String,
        /// The etag the writer expected
        expected: Etag,
        /// The etag actually stored
        actual: Etag,
    },

    // =========================================================================
    // Storage Errors (fatal for the current job)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: locked database, full disk,
    /// corrupted file, or an SQL bug in SpiteDocs.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch, failed batch commit, or other structural
    /// storage failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A stored document body failed its integrity check.
    #[error("corrupted document '{key}': checksum mismatch")]
    Corruption {
        /// Key of the corrupted document
        key: String,
    },

    /// A document body could not be encoded or decoded as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The writer or reader threads are gone (shut down or panicked).
    #[error("storage unavailable: {0}")]
    WriterUnavailable(String),

    // =========================================================================
    // Request Errors (nothing was written)
    // =========================================================================

    /// The request carried an invalid setting, e.g. a rate limit of zero.
    ///
    /// Always raised before a job reads its scope or reports any progress.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A document body is not a JSON object.
    ///
    /// Raised by puts before anything is written. Every stored document is an
    /// object, so patch scripts can always address its properties.
    #[error("invalid document '{key}': {reason}")]
    InvalidDocument {
        /// Key of the rejected document
        key: String,
        /// What is wrong with the body
        reason: String,
    },

    /// A patch script failed to compile, or could not be applied to the shape
    /// of a particular document.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

impl Error {
    /// Returns true for errors caused by the storage engine rather than by the
    /// request or by cancellation.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(_)
                | Error::Schema(_)
                | Error::Corruption { .. }
                | Error::Json(_)
                | Error::WriterUnavailable(_)
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
