//! Streaming-session registry: the reservation state machine.
//!
//! ```text
//! initialize ──► active ──finalize(success)──► completed
//!                   │
//!                   └──finalize(!success) / abort──► failed
//! ```
//!
//! Each transition runs inside one store transaction, so a session is
//! settled exactly once and a second finalize or abort sees no active
//! session.

use crate::config::{LedgerConfig, PricingConfig, SessionPolicy};
use crate::credits::{allocate_in, reserve_in, PricingCalculator};
use crate::error::LedgerError;
use crate::store::LedgerStore;
use crate::types::{
    CreditAllocation, RefundKind, SessionStatus, StreamingSession, UsageMetadata, UsageOutcome,
    UsageRecord,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Result of a successful [`SessionRegistry::initialize`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionReservation {
    pub session_id: String,
    pub estimated_credits: u64,
    pub allocated_credits: u64,
}

/// Result of a finalize or abort.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSettlement {
    pub session: StreamingSession,
    /// Credits the produced tokens are worth. May exceed the reservation.
    pub used_credits: u64,
    /// Credits actually kept: `min(used, allocated)`.
    pub charged_credits: u64,
    /// `allocated - charged`.
    pub refunded_credits: u64,
    /// The refund allocation, when anything was returned.
    pub refund: Option<CreditAllocation>,
}

/// Durable record of streaming-session lifecycle.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<LedgerStore>,
    pricing: PricingCalculator,
    policy: SessionPolicy,
    service_tag: String,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<LedgerStore>,
        pricing: PricingConfig,
        policy: SessionPolicy,
        service_tag: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pricing: PricingCalculator::new(pricing),
            policy,
            service_tag: service_tag.into(),
        }
    }

    pub fn from_config(store: Arc<LedgerStore>, config: &LedgerConfig) -> Self {
        Self::new(
            store,
            config.pricing.clone(),
            config.policy.clone(),
            config.service_tag.clone(),
        )
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    /// Reserve credits for a new session and record it as active.
    ///
    /// On insufficient credit nothing is deducted and no session row is
    /// created.
    #[instrument(skip(self))]
    pub async fn initialize(
        &self,
        session_id: &str,
        user_id: &str,
        model_id: &str,
        estimated_tokens: u64,
    ) -> Result<SessionReservation, LedgerError> {
        let estimated_credits = self.pricing.estimate_credits(model_id, estimated_tokens);
        let allocated_credits =
            PricingCalculator::apply_buffer(estimated_credits, self.policy.safety_buffer);

        self.store
            .transaction(|data| {
                if data.sessions.contains_key(session_id) {
                    return Err(LedgerError::DuplicateSession(session_id.to_string()));
                }

                reserve_in(data, user_id, allocated_credits, Utc::now())?;

                data.sessions.insert(
                    session_id.to_string(),
                    StreamingSession::new_active(
                        session_id,
                        user_id,
                        model_id,
                        estimated_credits,
                        allocated_credits,
                    ),
                );
                Ok(())
            })
            .await?;

        info!(
            "Session {} initialized for {} on {}: estimated {} credits, reserved {}",
            session_id, user_id, model_id, estimated_credits, allocated_credits
        );

        Ok(SessionReservation {
            session_id: session_id.to_string(),
            estimated_credits,
            allocated_credits,
        })
    }

    /// Settle a session after its stream ended.
    #[instrument(skip(self))]
    pub async fn finalize(
        &self,
        session_id: &str,
        user_id: &str,
        actual_tokens: u64,
        success: bool,
    ) -> Result<SessionSettlement, LedgerError> {
        let (status, outcome) = if success {
            (SessionStatus::Completed, UsageOutcome::Completed)
        } else {
            (SessionStatus::Failed, UsageOutcome::Failed)
        };

        self.settle(
            session_id,
            user_id,
            actual_tokens,
            status,
            outcome,
            RefundKind::Completion,
        )
        .await
    }

    /// Settle a session that was cut short (disconnect, provider error,
    /// timeout). Always ends `failed`.
    #[instrument(skip(self))]
    pub async fn abort(
        &self,
        session_id: &str,
        user_id: &str,
        tokens_generated: Option<u64>,
    ) -> Result<SessionSettlement, LedgerError> {
        self.settle(
            session_id,
            user_id,
            tokens_generated.unwrap_or(0),
            SessionStatus::Failed,
            UsageOutcome::Aborted,
            RefundKind::Abort,
        )
        .await
    }

    async fn settle(
        &self,
        session_id: &str,
        user_id: &str,
        tokens: u64,
        status: SessionStatus,
        outcome: UsageOutcome,
        refund_kind: RefundKind,
    ) -> Result<SessionSettlement, LedgerError> {
        let refund_expiry = self.policy.refund_expiry;

        let settlement = self
            .store
            .transaction(|data| {
                let session = data
                    .sessions
                    .get(session_id)
                    .filter(|s| s.user_id == user_id && s.status == SessionStatus::Active)
                    .cloned()
                    .ok_or_else(|| LedgerError::SessionNotFound(session_id.to_string()))?;

                let now = Utc::now();
                let used_credits = self.pricing.estimate_credits(&session.model_id, tokens);
                let charged_credits = used_credits.min(session.allocated_credits);
                let refunded_credits = session.allocated_credits - charged_credits;

                let refund = (refunded_credits > 0).then(|| {
                    allocate_in(
                        data,
                        user_id,
                        refunded_credits,
                        refund_expiry,
                        refund_kind.note(session_id),
                        now,
                    )
                });

                let duration_ms = (now - session.started_at).num_milliseconds().max(0) as u64;
                data.usage_log.push(UsageRecord::new(
                    user_id,
                    self.service_tag.clone(),
                    session.model_id.clone(),
                    charged_credits,
                    UsageMetadata {
                        session_id: session_id.to_string(),
                        tokens,
                        duration_ms,
                        outcome,
                    },
                ));

                let stored = data
                    .sessions
                    .get_mut(session_id)
                    .ok_or_else(|| LedgerError::SessionNotFound(session_id.to_string()))?;
                stored.close(status, used_credits, refunded_credits);

                Ok(SessionSettlement {
                    session: stored.clone(),
                    used_credits,
                    charged_credits,
                    refunded_credits,
                    refund,
                })
            })
            .await?;

        if settlement.used_credits > settlement.session.allocated_credits {
            warn!(
                "Session {} overran its reservation: used {} credits, reserved {}; overrun not charged",
                session_id, settlement.used_credits, settlement.session.allocated_credits
            );
        }

        info!(
            "Session {} {} for {}: {} tokens, used {} credits, refunded {}",
            session_id,
            settlement.session.status,
            user_id,
            tokens,
            settlement.used_credits,
            settlement.refunded_credits
        );

        Ok(settlement)
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: &str) -> Option<StreamingSession> {
        self.store
            .read(|data| data.sessions.get(session_id).cloned())
            .await
    }

    /// Sessions still holding a reservation, oldest first.
    pub async fn list_active(&self) -> Vec<StreamingSession> {
        self.store
            .read(|data| {
                let mut active: Vec<StreamingSession> = data
                    .sessions
                    .values()
                    .filter(|s| s.status == SessionStatus::Active)
                    .cloned()
                    .collect();
                active.sort_by_key(|s| s.started_at);
                active
            })
            .await
    }

    /// Abort every session left active by a previous process.
    ///
    /// A live stream cannot survive a restart, so its reservation is
    /// refunded in full.
    pub async fn recover_orphans(&self) -> Result<usize, LedgerError> {
        let orphans = self.list_active().await;
        for session in &orphans {
            warn!(
                "Aborting session {} orphaned by restart (user {})",
                session.session_id, session.user_id
            );
            self.abort(&session.session_id, &session.user_id, None).await?;
        }
        Ok(orphans.len())
    }
}
