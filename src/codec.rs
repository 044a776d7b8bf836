//! # Document Body Encoding and Decoding
//!
//! Document bodies are stored as compact JSON bytes next to an XXH3-64
//! checksum of those bytes. Decoding verifies the checksum before parsing, so
//! a damaged row surfaces as [`Error::Corruption`] instead of as a confusing
//! JSON error or, worse, as silently wrong data.
//!
//! ## Stored Format
//!
//! ```text
//! documents.data     = serde_json::to_vec(body)
//! documents.checksum = xxh3_64(data).to_le_bytes()
//! ```
//!
//! All metadata (key, collection, etag, timestamp) lives in table columns,
//! not in the blob.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a document body.
///
/// # Returns
///
/// A tuple of the encoded bytes and their checksum.
pub fn encode_document(body: &Value) -> Result<(Vec<u8>, Vec<u8>)> {
    let data = serde_json::to_vec(body)?;
    let checksum = compute_checksum(&data);
    Ok((data, checksum))
}

// =============================================================================
// Decoding
// =============================================================================

/// Verifies and decodes a stored document body.
///
/// `key` is only used to name the document in the error.
pub fn decode_document(key: &str, data: &[u8], checksum: &[u8]) -> Result<Value> {
    if compute_checksum(data) != checksum {
        return Err(Error::Corruption {
            key: key.to_string(),
        });
    }
    Ok(serde_json::from_slice(data)?)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes the checksum of an encoded body.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
