//! Gateway error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use credit_ledger::LedgerError;
use provider_bridge::ProviderError;
use serde::Serialize;
use std::time::Duration;
use stream_relay::RelayError;
use thiserror::Error;

/// Gateway error types.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session not active: {session_id}")]
    SessionNotActive {
        session_id: String,
        available: Vec<String>,
    },

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Missing user identity")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Stream timed out after {0:?}")]
    StreamTimeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Live sessions, present on `SESSION_NOT_ACTIVE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_sessions: Option<Vec<String>>,
}

impl GatewayError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS")
            }
            GatewayError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            GatewayError::SessionNotActive { .. } => (StatusCode::NOT_FOUND, "SESSION_NOT_ACTIVE"),
            GatewayError::DuplicateSession(_) => (StatusCode::CONFLICT, "DUPLICATE_SESSION"),
            GatewayError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            GatewayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            GatewayError::Provider(ProviderError::UnsupportedModel(_)) => {
                (StatusCode::BAD_REQUEST, "UNSUPPORTED_MODEL")
            }
            GatewayError::Provider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            GatewayError::StreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "STREAM_TIMEOUT"),
            GatewayError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let available_sessions = match &self {
            GatewayError::SessionNotActive { available, .. } => Some(available.clone()),
            _ => None,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            available_sessions,
        };

        (status, Json(body)).into_response()
    }
}

impl From<LedgerError> for GatewayError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => GatewayError::InsufficientCredits {
                required,
                available,
            },
            LedgerError::SessionNotFound(id) => GatewayError::SessionNotFound(id),
            LedgerError::DuplicateSession(id) => GatewayError::DuplicateSession(id),
            LedgerError::InvalidAmount(msg) => GatewayError::InvalidRequest(msg),
            LedgerError::Config(msg) => GatewayError::Internal(msg),
            other => GatewayError::Storage(other.to_string()),
        }
    }
}

impl From<RelayError> for GatewayError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::SessionNotActive {
                session_id,
                available,
            } => GatewayError::SessionNotActive {
                session_id,
                available,
            },
            RelayError::AlreadyActive(id) => GatewayError::DuplicateSession(id),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}
