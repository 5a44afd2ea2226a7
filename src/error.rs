// this_file: src/error.rs
//! Error types for the surfpool library

use thiserror::Error;

/// Main error type for surfpool operations
#[derive(Debug, Error)]
pub enum Error {
    /// The memory provider could not supply a region
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// Zero/oversized dimensions, unsupported pixel format, bad configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal bookkeeping inconsistency (a contract breach by the caller or a bug)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures caused by memory exhaustion.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, Error::AllocationFailure(_))
    }
}

/// Result type alias for surfpool operations
pub type Result<T> = std::result::Result<T, Error>;
