//! Credit ledger for metered model streaming.
//!
//! Users hold credit allocations, each with its own expiry. A streaming
//! session reserves its estimated cost (plus a safety buffer) up front and
//! settles once the stream ends, refunding whatever it did not use.
//!
//! # Architecture
//!
//! ```text
//! initialize → reserve (FIFO by expiry) → session active
//! stream ends → finalize/abort → usage record + refund allocation
//! ```
//!
//! # Modules
//!
//! - [`config`] - Ledger, pricing and reservation policy configuration
//! - [`credits`] - Balances, reservations, refunds and pricing
//! - [`sessions`] - Streaming-session state machine
//! - [`store`] - Transactional store with optional JSON snapshots

pub mod config;
pub mod credits;
pub mod error;
pub mod sessions;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use config::{LedgerConfig, PricingConfig, SessionPolicy};
pub use credits::{estimate_tokens, CreditService, PricingCalculator};
pub use error::LedgerError;
pub use sessions::{SessionRegistry, SessionReservation, SessionSettlement};
pub use store::{LedgerStats, LedgerStore};
pub use types::{
    CreditAllocation, CreditBalance, RefundKind, SessionStatus, StreamingSession, UsageMetadata,
    UsageOutcome, UsageRecord, UserId,
};

use std::sync::Arc;

/// Credit service and session registry sharing one store.
#[derive(Clone)]
pub struct Ledger {
    pub credits: CreditService,
    pub sessions: SessionRegistry,
}

impl Ledger {
    /// Open the store described by `config` and build both services on it.
    pub async fn open(config: &LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let store = LedgerStore::from_config(config).await?;
        Ok(Self::with_store(store, config))
    }

    /// Build both services on an existing store.
    pub fn with_store(store: Arc<LedgerStore>, config: &LedgerConfig) -> Self {
        Self {
            credits: CreditService::new(store.clone(), config.policy.clone()),
            sessions: SessionRegistry::from_config(store, config),
        }
    }
}
