//! Error types for the crash engine
//!
//! Every failure a player can observe maps to a specific variant so the
//! transport layer never has to surface a generic message.

use crate::round::RoundStatus;
use crate::types::{Amount, RoundId};

/// Result alias used across the crate
pub type CrashResult<T> = Result<T, CrashError>;

/// Root error type for all engine operations
#[derive(Debug, thiserror::Error)]
pub enum CrashError {
    /// Bad stake, threshold or timing. No state was changed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The player's balance cannot cover the stake. No state was changed.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    /// The client acted on a round that already moved on.
    #[error("Too late: round {round_id} has already crashed")]
    StaleRound { round_id: RoundId },

    /// Another settlement path won the race for the same wager.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A ledger write failed after all retries.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// A lifecycle transition that the round state machine forbids.
    #[error("Invalid round transition from {from} to {to}")]
    InvalidTransition { from: RoundStatus, to: RoundStatus },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// RocksDB and record encoding failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to open database: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Configuration loading and validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl CrashError {
    /// Whether the caller may retry the same operation and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrashError::ConcurrencyConflict(_) | CrashError::Persistence(_) | CrashError::Storage(_)
        )
    }

    /// Short machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            CrashError::Validation(_) => "VALIDATION_ERROR",
            CrashError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CrashError::StaleRound { .. } => "TOO_LATE",
            CrashError::ConcurrencyConflict(_) => "CONFLICT",
            CrashError::Persistence(_) => "PERSISTENCE_ERROR",
            CrashError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CrashError::Config(_) => "CONFIG_ERROR",
            CrashError::Storage(_) => "STORAGE_ERROR",
        }
    }
}
