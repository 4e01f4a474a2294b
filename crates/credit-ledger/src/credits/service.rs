//! Credit balances, FIFO-by-expiry reservation and refunds.

use crate::config::SessionPolicy;
use crate::error::LedgerError;
use crate::store::{LedgerData, LedgerStore};
use crate::types::{CreditAllocation, CreditBalance, UsageRecord};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Active allocations for a user, soonest expiry first.
fn active_allocations<'a>(
    data: &'a mut LedgerData,
    user_id: &'a str,
    now: DateTime<Utc>,
) -> Vec<&'a mut CreditAllocation> {
    let mut active: Vec<&mut CreditAllocation> = data
        .allocations
        .iter_mut()
        .filter(|a| a.user_id == user_id && a.is_active(now))
        .collect();
    // Stable sort keeps creation order for equal expiries.
    active.sort_by_key(|a| a.expires_at);
    active
}

/// Sum of remaining credits across a user's active allocations.
pub(crate) fn available_in(data: &LedgerData, user_id: &str, now: DateTime<Utc>) -> u64 {
    data.allocations
        .iter()
        .filter(|a| a.user_id == user_id && a.is_active(now))
        .map(|a| a.remaining)
        .sum()
}

/// Deduct `amount` from a user's allocations, oldest expiry first.
///
/// Fails without touching anything if the active balance is short. Must be
/// called inside a store transaction so the check and the walk see the same
/// state.
pub(crate) fn reserve_in(
    data: &mut LedgerData,
    user_id: &str,
    amount: u64,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let available = available_in(data, user_id, now);
    if available < amount {
        return Err(LedgerError::InsufficientCredits {
            required: amount,
            available,
        });
    }

    let mut outstanding = amount;
    for allocation in active_allocations(data, user_id, now) {
        if outstanding == 0 {
            break;
        }
        outstanding -= allocation.take(outstanding);
    }

    // The pre-check guarantees full coverage under the write lock.
    debug_assert_eq!(outstanding, 0);
    Ok(())
}

/// Append a new allocation. Refunds are never merged into existing ones.
pub(crate) fn allocate_in(
    data: &mut LedgerData,
    user_id: &str,
    amount: u64,
    expires_in: std::time::Duration,
    note: String,
    now: DateTime<Utc>,
) -> CreditAllocation {
    let expires_at = Duration::from_std(expires_in)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let allocation = CreditAllocation::new(user_id, amount, expires_at, note);
    data.allocations.push(allocation.clone());
    allocation
}

/// Credit service: balances, reservations, refunds and grants.
#[derive(Clone)]
pub struct CreditService {
    store: Arc<LedgerStore>,
    policy: SessionPolicy,
}

impl CreditService {
    pub fn new(store: Arc<LedgerStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Total remaining credits and the active allocations behind them.
    pub async fn balance(&self, user_id: &str) -> CreditBalance {
        let now = Utc::now();
        self.store
            .read(|data| {
                let mut allocations: Vec<CreditAllocation> = data
                    .allocations
                    .iter()
                    .filter(|a| a.user_id == user_id && a.is_active(now))
                    .cloned()
                    .collect();
                allocations.sort_by_key(|a| a.expires_at);

                CreditBalance {
                    user_id: user_id.to_string(),
                    total_remaining: allocations.iter().map(|a| a.remaining).sum(),
                    allocations,
                }
            })
            .await
    }

    /// Deduct `amount` credits, walking allocations oldest expiry first.
    #[instrument(skip(self))]
    pub async fn reserve(&self, user_id: &str, amount: u64) -> Result<(), LedgerError> {
        let result = self
            .store
            .transaction(|data| reserve_in(data, user_id, amount, Utc::now()))
            .await;

        match &result {
            Ok(()) => debug!("Reserved {} credits for {}", amount, user_id),
            Err(LedgerError::InsufficientCredits { available, .. }) => {
                warn!(
                    "Reservation of {} credits refused for {} (available {})",
                    amount, user_id, available
                );
            }
            Err(_) => {}
        }

        result
    }

    /// Return credits as a brand-new allocation with the refund expiry.
    #[instrument(skip(self, note))]
    pub async fn refund(
        &self,
        user_id: &str,
        amount: u64,
        note: impl Into<String>,
    ) -> Result<CreditAllocation, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("refund must be positive".into()));
        }
        let note = note.into();
        let expiry = self.policy.refund_expiry;

        let allocation = self
            .store
            .transaction(|data| Ok(allocate_in(data, user_id, amount, expiry, note, Utc::now())))
            .await?;

        info!("Refunded {} credits to {} ({})", amount, user_id, allocation.note);
        Ok(allocation)
    }

    /// Grant credits to a user with the grant expiry.
    #[instrument(skip(self, note))]
    pub async fn grant(
        &self,
        user_id: &str,
        amount: u64,
        note: Option<String>,
    ) -> Result<CreditAllocation, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("grant must be positive".into()));
        }
        let note = note.unwrap_or_else(|| "admin grant".to_string());
        let expiry = self.policy.grant_expiry;

        let allocation = self
            .store
            .transaction(|data| Ok(allocate_in(data, user_id, amount, expiry, note, Utc::now())))
            .await?;

        info!("Granted {} credits to {}", amount, user_id);
        Ok(allocation)
    }

    /// Usage records for a user, newest first.
    pub async fn usage(&self, user_id: &str) -> Vec<UsageRecord> {
        self.store
            .read(|data| {
                let mut records: Vec<UsageRecord> = data
                    .usage_log
                    .iter()
                    .filter(|u| u.user_id == user_id)
                    .cloned()
                    .collect();
                records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                records
            })
            .await
    }
}
