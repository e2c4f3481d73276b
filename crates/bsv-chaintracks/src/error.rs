//! Error types for header tracking operations.

use crate::hash::Hash;
use crate::live::InsertHeaderResult;

/// Errors that can occur while tracking, storing, or serving block headers.
///
/// Reorgs and missing predecessors are routine and reported through
/// [`InsertHeaderResult`](crate::live::InsertHeaderResult) flags, not here.
#[derive(Debug, thiserror::Error)]
pub enum ChaintracksError {
    /// A header could not be decoded or is internally inconsistent.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A hash value had the wrong length or format.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Chain work value could not be parsed.
    #[error("invalid chain work: {0}")]
    InvalidChainWork(String),

    /// Height range arithmetic was asked for an unrepresentable result.
    #[error("height range error: {0}")]
    HeightRange(String),

    /// A serialized hash index is malformed.
    #[error("hash index error: {0}")]
    HashIndex(String),

    /// Persisted state violates a storage invariant (gap or overlap between tiers).
    #[error("storage invariant violated: {0}")]
    StorageInvariant(String),

    /// A header was committed to live storage but the migration it
    /// triggered failed. `result` describes the committed insert.
    #[error("header {hash} stored but migration to bulk failed: {source}")]
    MigrationFailed {
        /// Hash of the committed header.
        hash: Hash,
        /// Outcome of the insert that did take effect.
        result: Box<InsertHeaderResult>,
        /// Why migration failed.
        source: Box<ChaintracksError>,
    },

    /// A bulk file cannot be appended because it does not extend the archive.
    #[error("bulk append rejected: {0}")]
    BulkAppend(String),

    /// Bulk file content does not match its recorded content hash.
    #[error("bulk file {file_name} hash mismatch: expected {expected}, actual {actual}")]
    BulkFileHashMismatch {
        /// The bulk file name.
        file_name: String,
        /// Hash recorded in the file descriptor.
        expected: String,
        /// Hash computed from the file content.
        actual: String,
    },

    /// Bulk file content is structurally invalid (broken hash chain, wrong length, work mismatch).
    #[error("bulk file {file_name} invalid: {reason}")]
    BulkFileInvalid {
        /// The bulk file name.
        file_name: String,
        /// What failed to verify.
        reason: String,
    },

    /// Bulk file content is not resident and has no way to be retrieved.
    #[error("bulk file {0} data unavailable")]
    BulkFileUnavailable(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned a non-2xx response.
    #[error("HTTP status {status_code} fetching {url}")]
    HttpStatus {
        /// HTTP status code.
        status_code: u16,
        /// The URL requested.
        url: String,
    },

    /// A header source failed; the orchestrator retries on its next pass.
    #[error("ingestor error: {0}")]
    Ingestor(String),

    /// Failed to serialize or deserialize JSON.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Options are inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The tracker has not been made available or is shutting down.
    #[error("chaintracks not available: {0}")]
    NotAvailable(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChaintracksError>;
