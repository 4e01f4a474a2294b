//! API request and response types.

use crate::orchestrator::StreamRequest;
use credit_ledger::{CreditAllocation, LedgerStats, UsageRecord};
use provider_bridge::{Message, ProviderFamily};
use serde::{Deserialize, Serialize};
use stream_relay::RelaySummary;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_relays: usize,
    pub providers: Vec<ProviderFamily>,
    pub ledger: LedgerStats,
}

/// Body of `POST /v1/chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatStreamRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatStreamRequest {
    pub fn into_stream_request(self) -> StreamRequest {
        StreamRequest {
            session_id: self
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            model: self.model,
            messages: self.messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Live sessions response.
#[derive(Debug, Serialize)]
pub struct ActiveSessionsResponse {
    pub count: usize,
    pub sessions: Vec<RelaySummary>,
}

/// Usage history response.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub user_id: String,
    pub records: Vec<UsageRecord>,
}

/// Model pricing response.
#[derive(Debug, Serialize)]
pub struct PricingResponse {
    pub model: String,
    pub provider: ProviderFamily,
    pub credits_per_1k_tokens: f64,
}

/// Body of `POST /v1/admin/credits`.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub user_id: String,
    pub amount: u64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Grant response.
#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub allocation: CreditAllocation,
    pub balance: u64,
}
