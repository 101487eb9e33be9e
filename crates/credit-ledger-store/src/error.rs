//! Error types for credit ledger storage.

use credit_ledger_core::{CreditError, UserId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// The balance row changed since it was read.
    #[error("version conflict for {user_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Account whose balance row moved.
        user_id: UserId,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A commit touched a transaction belonging to another user.
    #[error("transaction {transaction_id} does not belong to {user_id}")]
    ForeignTransaction {
        /// Account being committed.
        user_id: UserId,
        /// Offending transaction.
        transaction_id: String,
    },
}

impl From<StoreError> for CreditError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}
