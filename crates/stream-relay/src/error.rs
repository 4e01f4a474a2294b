//! Relay errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No primary stream is registered for the session.
    #[error("Session not active: {session_id}")]
    SessionNotActive {
        session_id: String,
        /// Sessions that do have a live primary, sorted.
        available: Vec<String>,
    },

    #[error("Session already has a primary stream: {0}")]
    AlreadyActive(String),

    /// The primary consumer went away; the writer should stop and abort.
    #[error("Primary consumer disconnected: {0}")]
    PrimaryDisconnected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
