//! Core types for the credit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a user, as issued by the identity provider.
pub type UserId = String;

/// A grant of credits with its own remaining balance and expiry.
///
/// Allocations are never deleted. Once `remaining` reaches zero the
/// allocation is exhausted and stays that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAllocation {
    /// Unique allocation ID.
    pub id: String,
    /// Owner of the credits.
    pub user_id: UserId,
    /// Credits granted.
    pub total: u64,
    /// Credits not yet consumed. Always `<= total`.
    pub remaining: u64,
    /// Allocation cannot be drawn from at or after this instant.
    pub expires_at: DateTime<Utc>,
    /// Origin of the grant (admin grant, refund, correction).
    pub note: String,
    /// When the allocation was created.
    pub created_at: DateTime<Utc>,
}

impl CreditAllocation {
    /// Create a fresh, untouched allocation.
    pub fn new(
        user_id: impl Into<UserId>,
        amount: u64,
        expires_at: DateTime<Utc>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            total: amount,
            remaining: amount,
            expires_at,
            note: note.into(),
            created_at: Utc::now(),
        }
    }

    /// Whether credits can still be drawn from this allocation.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 && self.expires_at > now
    }

    /// Take up to `amount` credits. Returns how many were taken.
    pub fn take(&mut self, amount: u64) -> u64 {
        let taken = self.remaining.min(amount);
        self.remaining -= taken;
        taken
    }
}

/// Current balance for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: UserId,
    /// Sum of `remaining` across active allocations.
    pub total_remaining: u64,
    /// Active allocations, soonest expiry first.
    pub allocations: Vec<CreditAllocation>,
}

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Reservation held, stream in flight.
    Active,
    /// Stream finished successfully.
    Completed,
    /// Stream errored, timed out, or the client went away.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The unit of reservation: one streaming model interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSession {
    /// Caller-supplied, globally unique.
    pub session_id: String,
    pub user_id: UserId,
    pub model_id: String,
    /// Pre-stream cost guess.
    pub estimated_credits: u64,
    /// Credits actually reserved (estimate with safety buffer).
    pub allocated_credits: u64,
    /// Filled in exactly once by finalize or abort.
    pub used_credits: Option<u64>,
    /// Credits returned to the user when the session ended.
    pub refunded_credits: Option<u64>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StreamingSession {
    /// Create a new session in the `active` state.
    pub fn new_active(
        session_id: impl Into<String>,
        user_id: impl Into<UserId>,
        model_id: impl Into<String>,
        estimated_credits: u64,
        allocated_credits: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            model_id: model_id.into(),
            estimated_credits,
            allocated_credits,
            used_credits: None,
            refunded_credits: None,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a terminal state, stamping usage and completion time.
    pub fn close(&mut self, status: SessionStatus, used_credits: u64, refunded_credits: u64) {
        self.status = status;
        self.used_credits = Some(used_credits);
        self.refunded_credits = Some(refunded_credits);
        self.completed_at = Some(Utc::now());
    }
}

/// How a metered session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageOutcome {
    Completed,
    Failed,
    Aborted,
}

/// Free-form metering details attached to a usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub session_id: String,
    /// Estimated tokens produced.
    pub tokens: u64,
    /// Wall-clock duration of the session.
    pub duration_ms: u64,
    pub outcome: UsageOutcome,
}

/// Immutable, append-only usage log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: UserId,
    /// Service tag (e.g. `llm-chat`).
    pub service: String,
    /// Operation performed; the model id for chat sessions.
    pub operation: String,
    /// Credits charged.
    pub credits: u64,
    pub timestamp: DateTime<Utc>,
    pub metadata: UsageMetadata,
}

impl UsageRecord {
    /// Create a new usage record.
    pub fn new(
        user_id: impl Into<UserId>,
        service: impl Into<String>,
        operation: impl Into<String>,
        credits: u64,
        metadata: UsageMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            service: service.into(),
            operation: operation.into(),
            credits,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Why credits are being returned to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundKind {
    /// Unused part of the reservation after a finished session.
    Completion,
    /// Unused part of the reservation after an aborted session.
    Abort,
}

impl RefundKind {
    /// Allocation note identifying the originating session.
    pub fn note(&self, session_id: &str) -> String {
        match self {
            RefundKind::Completion => format!("completion refund for {}", session_id),
            RefundKind::Abort => format!("abort refund for {}", session_id),
        }
    }
}
