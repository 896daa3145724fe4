//! Executor error types.

use thiserror::Error;

/// Join execution errors.
#[derive(Error, Debug, Clone)]
pub enum JoinError {
    /// Query was cancelled cooperatively
    #[error("Query execution was killed")]
    Killed,

    /// Column not found in table
    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    /// Column already exists in table
    #[error("Column '{column}' already exists in table '{table}'")]
    ColumnAlreadyExists { table: String, column: String },

    /// Value does not match the column type
    #[error("Type mismatch for column '{column}': expected {expected}")]
    TypeMismatch { column: String, expected: String },

    /// A join buffer cannot be sized at or above its floor
    #[error(
        "Join buffer for table '{table}' needs {required} bytes, only {available} available"
    )]
    BufferFloorExceeded {
        table: String,
        required: usize,
        available: usize,
    },

    /// Total join buffer space exceeds the per-query budget
    #[error("Join buffer space {requested} bytes exceeds budget {budget} bytes")]
    SpaceBudgetExceeded { requested: usize, budget: usize },

    /// Record read at an invalid buffer offset
    #[error("Invalid record offset {offset} in join buffer (end: {end})")]
    InvalidRecordOffset { offset: usize, end: usize },

    /// Storage engine failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Fatal error while writing a temporary table row
    #[error("Temporary table write failed: {0}")]
    TempTableWrite(String),

    /// Multi-range read initialization failure
    #[error("Multi-range read init failed: {0}")]
    MrrInit(String),
}
