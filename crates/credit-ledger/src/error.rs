//! Ledger error types.

use thiserror::Error;

/// Errors that can occur in the credit ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Reservation refused; nothing was deducted.
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    /// No active session with this id for this user.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session with this id already exists.
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// Amount must be greater than zero.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Storage I/O error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}
