//! Session orchestration: reserve, stream, fan out, settle.
//!
//! ```text
//! start_stream
//!   ├─ SessionRegistry::initialize        (InsufficientCredits → caller, no provider call)
//!   └─ spawn session task
//!        ├─ ChatProvider::stream_chat     (open failure → abort, error to caller)
//!        ├─ RelayRegistry::open_primary   (events handed back to caller)
//!        └─ relay loop until one of:
//!             provider end      → finalize(success)  → complete event
//!             provider error    → abort              → error event
//!             max duration      → cancel + abort     → error event
//!             primary gone      → cancel + abort     → error event
//! ```

use crate::config::SessionConfig;
use crate::error::GatewayError;
use crate::identity::Principal;
use credit_ledger::{
    estimate_tokens, Ledger, SessionReservation, SessionSettlement, StreamingSession,
};
use futures::StreamExt;
use provider_bridge::{ChatProvider, ChatRequest, Message, TokenStream};
use serde::Serialize;
use std::sync::Arc;
use stream_relay::{
    ObserverHandle, RelayError, RelayPublisher, RelayRegistry, RelaySummary, StreamEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

/// A chat-stream request in provider-neutral form.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A session whose provider stream is open and relaying.
#[derive(Debug)]
pub struct StartedStream {
    pub reservation: SessionReservation,
    /// Primary consumer's events; dropping it counts as a client disconnect.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Resolves once the session is settled and the relay closed.
    pub task: JoinHandle<SessionOutcome>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    ProviderFailed(String),
    TimedOut,
    ClientDisconnected,
}

/// Final state of a session task.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: String,
    pub end: StreamEnd,
    /// Billed tokens: prompt plus generated output. Zero when the provider
    /// stream never opened.
    pub tokens: u64,
    /// Estimated tokens generated.
    pub completion_tokens: u64,
    /// `None` only when settling the ledger failed.
    pub settlement: Option<SessionSettlement>,
}

/// Payload of the `complete` event.
#[derive(Debug, Serialize)]
struct CompletionSummary {
    session_id: String,
    tokens: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    used_credits: u64,
    charged_credits: u64,
    refunded_credits: u64,
}

/// Ties credit reservation, provider streaming and fan-out together.
#[derive(Clone)]
pub struct SessionOrchestrator {
    ledger: Ledger,
    provider: Arc<dyn ChatProvider>,
    relays: RelayRegistry,
    config: SessionConfig,
}

impl SessionOrchestrator {
    pub fn new(
        ledger: Ledger,
        provider: Arc<dyn ChatProvider>,
        relays: RelayRegistry,
        config: SessionConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            relays,
            config,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn relays(&self) -> &RelayRegistry {
        &self.relays
    }

    /// Tokens a request is expected to cost: prompt plus completion budget.
    pub fn estimate_request_tokens(&self, request: &StreamRequest) -> u64 {
        let prompt = prompt_tokens(&request.messages);
        let completion = request
            .max_tokens
            .unwrap_or(self.config.default_completion_tokens);
        prompt + u64::from(completion)
    }

    /// Reserve credits and start streaming.
    ///
    /// Returns once the provider stream is open, so reservation and provider
    /// failures reach the caller as errors rather than as stream events.
    #[instrument(skip(self, principal, request), fields(session_id = %request.session_id, model = %request.model, user = %principal.user_id))]
    pub async fn start_stream(
        &self,
        principal: &Principal,
        request: StreamRequest,
    ) -> Result<StartedStream, GatewayError> {
        validate(&request)?;

        let deadline = Instant::now() + self.config.max_duration;
        let estimated_tokens = self.estimate_request_tokens(&request);

        let reservation = match self
            .ledger
            .sessions
            .initialize(
                &request.session_id,
                &principal.user_id,
                &request.model,
                estimated_tokens,
            )
            .await
        {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!("Reservation refused: {}", e);
                return Err(e.into());
            }
        };

        // From here the task settles the session even if the caller goes away
        let (opened_tx, opened_rx) = oneshot::channel();
        let task = tokio::spawn(
            self.clone()
                .run_session(principal.user_id.clone(), request, deadline, opened_tx)
                .in_current_span(),
        );

        match opened_rx.await {
            Ok(Ok(events)) => Ok(StartedStream {
                reservation,
                events,
                task,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::Internal(
                "session task ended before the stream opened".into(),
            )),
        }
    }

    async fn run_session(
        self,
        user_id: String,
        request: StreamRequest,
        deadline: Instant,
        opened: oneshot::Sender<Result<mpsc::Receiver<StreamEvent>, GatewayError>>,
    ) -> SessionOutcome {
        let session_id = request.session_id.clone();
        let cancel = CancellationToken::new();
        let prompt_tokens = prompt_tokens(&request.messages);

        let chat = ChatRequest {
            model: request.model.clone(),
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let opening = self.provider.stream_chat(chat, cancel.clone());
        let tokens = match timeout_at(deadline, opening).await {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => {
                error!("Provider stream failed to open: {}", e);
                let end = StreamEnd::ProviderFailed(e.to_string());
                let outcome = self.settle(&session_id, &user_id, end, 0, 0).await;
                let _ = opened.send(Err(e.into()));
                return outcome;
            }
            Err(_) => {
                cancel.cancel();
                warn!("Timed out opening provider stream");
                let outcome = self
                    .settle(&session_id, &user_id, StreamEnd::TimedOut, 0, 0)
                    .await;
                let _ = opened.send(Err(GatewayError::StreamTimeout(
                    self.config.max_duration,
                )));
                return outcome;
            }
        };

        let (mut publisher, events) = match self
            .relays
            .open_primary(&session_id, &user_id, &request.model)
        {
            Ok(pair) => pair,
            Err(e) => {
                cancel.cancel();
                let end = StreamEnd::ProviderFailed(e.to_string());
                let outcome = self.settle(&session_id, &user_id, end, 0, 0).await;
                let _ = opened.send(Err(e.into()));
                return outcome;
            }
        };

        // A failed send drops the receiver, which the relay loop sees as a
        // client disconnect.
        if opened.send(Ok(events)).is_err() {
            warn!("Caller gone before stream start");
        }
        info!("Provider stream open, relaying");

        let (end, text) = relay_tokens(&mut publisher, tokens, deadline).await;
        cancel.cancel();

        // The prompt reached the provider, so it is billed however the stream ended
        let completion_tokens = estimate_tokens(&text);
        let outcome = self
            .settle(
                &session_id,
                &user_id,
                end,
                prompt_tokens + completion_tokens,
                completion_tokens,
            )
            .await;
        self.close_relay(publisher, &outcome).await;
        outcome
    }

    /// Finalize or abort the session in the ledger, billing `tokens`.
    async fn settle(
        &self,
        session_id: &str,
        user_id: &str,
        end: StreamEnd,
        tokens: u64,
        completion_tokens: u64,
    ) -> SessionOutcome {
        let sessions = &self.ledger.sessions;
        let result = match &end {
            StreamEnd::Completed => sessions.finalize(session_id, user_id, tokens, true).await,
            _ => sessions.abort(session_id, user_id, Some(tokens)).await,
        };

        let settlement = match result {
            Ok(settlement) => {
                info!(
                    end = ?end,
                    tokens,
                    used = settlement.used_credits,
                    refunded = settlement.refunded_credits,
                    "Session settled"
                );
                Some(settlement)
            }
            Err(e) => {
                error!(end = ?end, "Failed to settle session {}: {}", session_id, e);
                None
            }
        };

        SessionOutcome {
            session_id: session_id.to_string(),
            end,
            tokens,
            completion_tokens,
            settlement,
        }
    }

    /// Send the terminal event to every consumer.
    async fn close_relay(&self, publisher: RelayPublisher, outcome: &SessionOutcome) {
        let Some(settlement) = outcome.settlement.as_ref() else {
            publisher.fail("session settlement failed").await;
            return;
        };

        match &outcome.end {
            StreamEnd::Completed => {
                let summary = CompletionSummary {
                    session_id: outcome.session_id.clone(),
                    tokens: outcome.tokens,
                    prompt_tokens: outcome.tokens - outcome.completion_tokens,
                    completion_tokens: outcome.completion_tokens,
                    used_credits: settlement.used_credits,
                    charged_credits: settlement.charged_credits,
                    refunded_credits: settlement.refunded_credits,
                };
                let payload = serde_json::to_string(&summary).unwrap_or_default();
                publisher.complete(payload).await;
            }
            StreamEnd::ProviderFailed(message) => {
                publisher.fail(message.clone()).await;
            }
            StreamEnd::TimedOut => {
                publisher
                    .fail(format!(
                        "stream timed out after {:?}",
                        self.config.max_duration
                    ))
                    .await;
            }
            StreamEnd::ClientDisconnected => {
                publisher.fail("client disconnected").await;
            }
        }
    }

    /// Attach a supervisor to a live session.
    #[instrument(skip(self), fields(user = %principal.user_id))]
    pub fn observe(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<ObserverHandle, GatewayError> {
        principal.require_observer()?;
        Ok(self.relays.subscribe_observer(session_id)?)
    }

    /// Live sessions, for supervisors.
    pub fn active_sessions(&self, principal: &Principal) -> Result<Vec<RelaySummary>, GatewayError> {
        principal.require_observer()?;
        Ok(self.relays.list_active())
    }

    /// Session row, visible to its owner and to supervisors.
    pub async fn session(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<StreamingSession, GatewayError> {
        self.ledger
            .sessions
            .get(session_id)
            .await
            .filter(|s| s.user_id == principal.user_id || principal.can_observe())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }
}

fn prompt_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

fn validate(request: &StreamRequest) -> Result<(), GatewayError> {
    if request.session_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("session_id is empty".into()));
    }
    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model is empty".into()));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages is empty".into()));
    }
    if request.max_tokens == Some(0) {
        return Err(GatewayError::InvalidRequest(
            "max_tokens must be greater than zero".into(),
        ));
    }
    Ok(())
}

/// Pump provider deltas into the relay until the stream ends.
///
/// Returns how it ended and the accumulated text.
async fn relay_tokens(
    publisher: &mut RelayPublisher,
    mut tokens: TokenStream,
    deadline: Instant,
) -> (StreamEnd, String) {
    let mut text = String::new();

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Session exceeded maximum duration");
                break StreamEnd::TimedOut;
            }
            _ = publisher.primary_closed() => {
                info!("Primary consumer disconnected");
                break StreamEnd::ClientDisconnected;
            }
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                text.push_str(&delta);
                // A connected consumer that stops reading fills the primary queue
                let published = tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!("Session exceeded maximum duration with a stalled consumer");
                        break StreamEnd::TimedOut;
                    }
                    published = publisher.publish(delta) => published,
                };
                match published {
                    Ok(_) => {}
                    Err(RelayError::PrimaryDisconnected(_)) => {
                        info!("Primary consumer disconnected");
                        break StreamEnd::ClientDisconnected;
                    }
                    Err(e) => break StreamEnd::ProviderFailed(e.to_string()),
                }
            }
            Some(Err(e)) => {
                warn!("Provider stream failed: {}", e);
                break StreamEnd::ProviderFailed(e.to_string());
            }
            None => break StreamEnd::Completed,
        }
    };

    (end, text)
}
