//! Big map index error types

use thiserror::Error;

/// Big map index result type
pub type Result<T> = std::result::Result<T, BigMapIndexError>;

/// Big map index errors
#[derive(Error, Debug)]
pub enum BigMapIndexError {
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Rollback invariant violation: {0}")]
    RollbackInvariantViolation(String),

    #[error("Out-of-order diff for big map {big_map_id} key {key_hash}: ({level}, {operation_id}) is behind ({last_level}, {last_operation_id})")]
    OutOfOrderDiff {
        big_map_id: u64,
        key_hash: String,
        level: u64,
        operation_id: u64,
        last_level: u64,
        last_operation_id: u64,
    },

    #[error("Big map not found: {0}")]
    BigMapNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("ParityDB error: {0}")]
    ParityDBError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<parity_db::Error> for BigMapIndexError {
    fn from(err: parity_db::Error) -> Self {
        BigMapIndexError::ParityDBError(err.to_string())
    }
}
