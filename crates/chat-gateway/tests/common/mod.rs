//! Shared fixtures for gateway integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chat_gateway::{
    api::{create_router, AppState},
    config::SessionConfig,
    Principal, Role, SessionOrchestrator, StreamRequest,
};
use credit_ledger::{Ledger, LedgerConfig};
use provider_bridge::{ChatProvider, ChatRequest, Message, ProviderError, TokenStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_relay::{RelayConfig, RelayRegistry};
use tokio_util::sync::CancellationToken;

/// Priced at the default 1.0 credits per 1k tokens.
pub const TEST_MODEL: &str = "gpt-test";

/// Provider that replays a fixed script of deltas.
#[derive(Default)]
pub struct ScriptedProvider {
    tokens: Vec<String>,
    delay: Duration,
    open_delay: Duration,
    /// Fail with this message after every token has been sent.
    fail_after: Option<String>,
    /// Refuse to open the stream.
    open_error: bool,
    /// Never end the stream on its own.
    hang: bool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn failing_after(mut self, message: &str) -> Self {
        self.fail_after = Some(message.to_string());
        self
    }

    pub fn refusing_to_open(mut self) -> Self {
        self.open_error = true;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn stream_chat(
        &self,
        _request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.open_error {
            return Err(ProviderError::Api {
                status: 500,
                message: "upstream unavailable".into(),
            });
        }

        let tokens = self.tokens.clone();
        let delay = self.delay;
        let fail_after = self.fail_after.clone();
        let hang = self.hang;

        Ok(Box::pin(async_stream::stream! {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return;
                }
                yield Ok(token);
            }
            if let Some(message) = fail_after {
                yield Err(ProviderError::Stream(message));
                return;
            }
            if hang {
                cancel.cancelled().await;
            }
        }))
    }
}

pub fn session_config(max_duration: Duration) -> SessionConfig {
    SessionConfig {
        max_duration,
        default_completion_tokens: 1000,
    }
}

/// Orchestrator on an in-memory ledger, with `credits` granted to `alice`.
pub async fn orchestrator_with(
    provider: Arc<dyn ChatProvider>,
    credits: u64,
    max_duration: Duration,
) -> SessionOrchestrator {
    orchestrator_with_relay(provider, credits, max_duration, RelayConfig::default()).await
}

pub async fn orchestrator_with_relay(
    provider: Arc<dyn ChatProvider>,
    credits: u64,
    max_duration: Duration,
    relay: RelayConfig,
) -> SessionOrchestrator {
    let ledger = Ledger::open(&LedgerConfig::default()).await.unwrap();
    if credits > 0 {
        ledger.credits.grant("alice", credits, None).await.unwrap();
    }
    let relays = RelayRegistry::new(relay).unwrap();
    SessionOrchestrator::new(ledger, provider, relays, session_config(max_duration))
}

pub async fn orchestrator(provider: Arc<dyn ChatProvider>, credits: u64) -> SessionOrchestrator {
    orchestrator_with(provider, credits, Duration::from_secs(30)).await
}

pub async fn app_state(provider: Arc<dyn ChatProvider>, credits: u64) -> AppState {
    AppState::new(orchestrator(provider, credits).await, Vec::new())
}

pub async fn app(provider: Arc<dyn ChatProvider>, credits: u64) -> axum::Router {
    create_router(app_state(provider, credits).await)
}

/// A one-message request budgeting 1000 completion tokens.
///
/// At 1.0 credits per 1k tokens this estimates 2 credits and reserves 3.
pub fn request(session_id: &str) -> StreamRequest {
    StreamRequest {
        session_id: session_id.to_string(),
        model: TEST_MODEL.to_string(),
        messages: vec![Message::user("hi")],
        max_tokens: Some(1000),
        temperature: None,
    }
}

pub fn student(user_id: &str) -> Principal {
    Principal::new(user_id, Role::Student)
}

pub fn supervisor(user_id: &str) -> Principal {
    Principal::new(user_id, Role::Supervisor)
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: axum::response::Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}
