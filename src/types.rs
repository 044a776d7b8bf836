//! # Domain Types for SpiteDocs
//!
//! Core types of the document store and of collection-wide bulk operations:
//! keys, collections, etags, documents, and the small value types a bulk job
//! passes between its components.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! As elsewhere in the codebase, primitives are wrapped in single-field
//! structs. An [`Etag`] cannot be passed where a document count is expected,
//! and a [`CollectionName`] cannot be confused with a [`DocumentKey`].
//!
//! ## Invariants
//!
//! - [`Etag`]: Global, strictly increasing, never reused, zero means "none"
//! - [`DocumentRef`]: A read-only snapshot view; never mutated after a scan
//! - [`ScopeBound`]: Captured once per bulk job under a single read snapshot

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Identification
// =============================================================================

/// The unique key of a document, e.g. `"orders/1-A"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Creates a new document key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the string representation of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The name of a document collection, e.g. `"Orders"`.
///
/// Every document belongs to exactly one collection. Bulk operations are
/// always scoped to a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    /// Creates a new collection name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the string representation of this collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CollectionName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Etags
// =============================================================================

/// A version stamp assigned to a document on every write.
///
/// # Invariants
///
/// - Strictly increases with each write, across all collections
/// - Never reused, even after the document carrying it is deleted
/// - Zero is the sentinel for "no document" / "before the first write"
///
/// Etags double as the scan order of a collection: a bulk job walks a
/// collection in ascending etag order and stops at the high-water etag it
/// captured when it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Etag(u64);

impl Etag {
    /// Sentinel: no etag, or "before any document".
    pub const ZERO: Etag = Etag(0);

    /// The first etag handed out by a fresh database.
    pub const FIRST: Etag = Etag(1);

    /// Creates an Etag from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next etag.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true for the "no etag" sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Documents
// =============================================================================

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Unique document key.
    pub key: DocumentKey,

    /// Collection the document belongs to.
    pub collection: CollectionName,

    /// Etag assigned by the write that produced this version.
    pub etag: Etag,

    /// Unix timestamp (milliseconds) of that write.
    pub last_modified_ms: u64,

    /// Document body.
    pub data: Value,
}

/// A `{key, etag}` pair yielded by a collection scan.
///
/// This is a snapshot view: the etag is the one the document had when the scan
/// read it, which may be stale by the time the document is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Key of the scanned document.
    pub key: DocumentKey,
    /// Etag at scan time.
    pub etag: Etag,
}

impl DocumentRef {
    /// Creates a new document reference.
    pub fn new(key: impl Into<DocumentKey>, etag: Etag) -> Self {
        Self {
            key: key.into(),
            etag,
        }
    }
}

/// The fixed universe of documents a bulk job may touch.
///
/// Read once, under one read snapshot, when the job starts. Documents created
/// or re-etagged above `high_water` afterwards are outside the job's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeBound {
    /// Largest etag in the collection at job start ([`Etag::ZERO`] if empty).
    pub high_water: Etag,

    /// Number of documents in the collection at job start.
    pub total_count: u64,
}

impl ScopeBound {
    /// Returns true if the collection was empty when the scope was captured.
    pub fn is_empty(&self) -> bool {
        self.total_count == 0 || self.high_water.is_zero()
    }
}

// =============================================================================
// Write Commands
// =============================================================================

/// Command to create or replace a document.
#[derive(Debug, Clone)]
pub struct PutDocumentCommand {
    /// Key of the document to write.
    pub key: DocumentKey,

    /// Collection the document belongs to.
    pub collection: CollectionName,

    /// New document body.
    pub data: Value,

    /// Optimistic concurrency check.
    ///
    /// - `None`: write unconditionally
    /// - `Some(Etag::ZERO)`: the document must not exist yet
    /// - `Some(etag)`: the document must currently carry exactly this etag
    pub expected_etag: Option<Etag>,
}

impl PutDocumentCommand {
    /// Creates an unconditional put.
    pub fn new(
        key: impl Into<DocumentKey>,
        collection: impl Into<CollectionName>,
        data: Value,
    ) -> Self {
        Self {
            key: key.into(),
            collection: collection.into(),
            data,
            expected_etag: None,
        }
    }

    /// Requires the stored document to carry `etag` (or not to exist, for
    /// [`Etag::ZERO`]).
    pub fn with_expected_etag(mut self, etag: Etag) -> Self {
        self.expected_etag = Some(etag);
        self
    }
}

/// Result of a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Key of the written document.
    pub key: DocumentKey,
    /// Etag assigned to the new version.
    pub etag: Etag,
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    /// Key that was deleted.
    pub key: DocumentKey,
    /// Etag of the removed version, or `None` if nothing was stored.
    pub deleted_etag: Option<Etag>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_ordering_and_sentinel() {
        assert!(Etag::ZERO.is_zero());
        assert!(Etag::ZERO < Etag::FIRST);
        assert_eq!(Etag::FIRST.next(), Etag::from_raw(2));
        assert_eq!(Etag::from_raw(42).to_string(), "42");
    }

    #[test]
    fn test_scope_bound_empty() {
        let empty = ScopeBound {
            high_water: Etag::ZERO,
            total_count: 0,
        };
        assert!(empty.is_empty());

        let orders = ScopeBound {
            high_water: Etag::from_raw(9),
            total_count: 3,
        };
        assert!(!orders.is_empty());
    }

    #[test]
    fn test_put_command_builder() {
        let cmd = PutDocumentCommand::new("orders/1", "Orders", serde_json::json!({"total": 10}))
            .with_expected_etag(Etag::ZERO);

        assert_eq!(cmd.key.as_str(), "orders/1");
        assert_eq!(cmd.collection.as_str(), "Orders");
        assert_eq!(cmd.expected_etag, Some(Etag::ZERO));
    }
}
