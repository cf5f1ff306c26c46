//! Error types for intentguard.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all intentguard operations.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Validation error with field context
    #[error("validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    /// A decimal literal could not be represented exactly
    #[error("precision loss parsing '{input}': {reason}")]
    PrecisionLoss { input: String, reason: String },

    /// Checked decimal or rational arithmetic overflowed
    #[error("arithmetic overflow in {operation}")]
    Overflow { operation: String },

    /// Resource limit exceeded
    #[error("{resource} limit exceeded: {actual} > {limit}")]
    ResourceLimit { resource: String, limit: usize, actual: usize },

    /// Verifier ran out of time or was cancelled
    #[error("verification interrupted: {reason}")]
    Interrupted { reason: String },

    /// I/O failure on a ledger file
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Canonical state file does not exist
    #[error("state missing: canonical ledger file {} not found", .path.display())]
    StateMissing { path: PathBuf },

    /// Canonical state file exists but cannot be decoded
    #[error("state malformed in {}: {reason}", .path.display())]
    StateMalformed { path: PathBuf, reason: String },

    /// Stored Merkle root differs from the recomputed one
    #[error("merkle mismatch in {}: expected {expected}, computed {computed}", .path.display())]
    MerkleMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },

    /// WAL record could not be decoded during recovery
    #[error("corrupt WAL record in {} at byte {offset}: {reason} (raw: {raw:?})", .path.display())]
    WalCorrupt {
        path: PathBuf,
        offset: u64,
        raw: String,
        reason: String,
    },

    /// Transaction lifecycle violation (duplicate BEGIN, COMMIT without BEGIN, ...)
    #[error("invalid transition for tx '{tx_id}': {reason}")]
    InvalidTransition { tx_id: String, reason: String },

    /// Ledger already initialized
    #[error("ledger already initialized at {}", .path.display())]
    AlreadyInitialized { path: PathBuf },

    /// Configuration could not be loaded
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Serialization error
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Lock acquisition failed (thread safety)
    #[error("lock poisoned for resource: {resource}")]
    LockPoisoned { resource: String },
}

/// Result type alias for intentguard operations.
pub type GuardResult<T> = Result<T, GuardError>;

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for conditions that must stop the ledger from serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StateMissing { .. }
                | Self::StateMalformed { .. }
                | Self::MerkleMismatch { .. }
                | Self::WalCorrupt { .. }
        )
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GuardError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned {
            resource: "mutex".to_string(),
        }
    }
}
