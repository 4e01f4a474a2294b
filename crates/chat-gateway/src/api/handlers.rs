//! HTTP request handlers.

use super::types::{
    ActiveSessionsResponse, ChatStreamRequest, GrantRequest, GrantResponse, HealthResponse,
    PricingResponse, UsageResponse,
};
use super::AppState;
use crate::error::GatewayError;
use crate::identity::Principal;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use credit_ledger::{CreditBalance, StreamingSession};
use futures::{Stream, StreamExt};
use provider_bridge::ProviderFamily;
use serde_json::json;
use stream_relay::{ObserverHandle, ObserverMessage, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ledger = state.orchestrator.ledger().credits.store().stats().await;

    Json(HealthResponse {
        status: "ok".to_string(),
        active_relays: state.orchestrator.relays().len(),
        providers: state.providers.clone(),
        ledger,
    })
}

/// Reserve credits and stream a completion as Server-Sent Events.
///
/// Reservation and provider-open failures are returned as JSON errors
/// before any event is sent; later failures arrive as an `error` event.
pub async fn chat_stream(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<ChatStreamRequest>,
) -> Result<Response, GatewayError> {
    let started = state
        .orchestrator
        .start_stream(&principal, request.into_stream_request())
        .await?;

    let reservation = started.reservation;
    info!(
        session_id = %reservation.session_id,
        allocated = reservation.allocated_credits,
        "Streaming session started"
    );

    let headers = [
        ("x-session-id", reservation.session_id.clone()),
        (
            "x-allocated-credits",
            reservation.allocated_credits.to_string(),
        ),
        (
            "x-estimated-credits",
            reservation.estimated_credits.to_string(),
        ),
    ];

    let sse = Sse::new(primary_events(started.events)).keep_alive(KeepAlive::default());
    Ok((headers, sse).into_response())
}

/// List sessions with a live stream.
pub async fn active_sessions(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ActiveSessionsResponse>, GatewayError> {
    let sessions = state.orchestrator.active_sessions(&principal)?;

    Ok(Json(ActiveSessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// Mirror a live session: buffered history first, then live events.
pub async fn observe_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, GatewayError> {
    let handle = state.orchestrator.observe(&principal, &session_id)?;
    info!(
        session_id = %session_id,
        supervisor = %principal.user_id,
        "Observer connected"
    );

    Ok(Sse::new(observer_events(handle)).keep_alive(KeepAlive::default()))
}

/// Get a session row.
pub async fn get_session(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
) -> Result<Json<StreamingSession>, GatewayError> {
    let session = state.orchestrator.session(&principal, &session_id).await?;
    Ok(Json(session))
}

/// The caller's balance and active allocations.
pub async fn balance(State(state): State<AppState>, principal: Principal) -> Json<CreditBalance> {
    Json(
        state
            .orchestrator
            .ledger()
            .credits
            .balance(&principal.user_id)
            .await,
    )
}

/// The caller's usage history, newest first.
pub async fn usage(State(state): State<AppState>, principal: Principal) -> Json<UsageResponse> {
    let records = state
        .orchestrator
        .ledger()
        .credits
        .usage(&principal.user_id)
        .await;

    Json(UsageResponse {
        user_id: principal.user_id,
        records,
    })
}

/// Price of a model in credits per 1,000 tokens.
pub async fn pricing(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Json<PricingResponse> {
    let credits_per_1k_tokens = state
        .orchestrator
        .ledger()
        .sessions
        .pricing()
        .price_for_model(&model);

    Json(PricingResponse {
        provider: ProviderFamily::for_model(&model),
        model,
        credits_per_1k_tokens,
    })
}

/// Grant credits to a user (admin only).
pub async fn grant_credits(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<GrantRequest>,
) -> Result<(StatusCode, Json<GrantResponse>), GatewayError> {
    principal.require_admin()?;
    if request.user_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("user_id is empty".into()));
    }

    let credits = &state.orchestrator.ledger().credits;
    let allocation = credits
        .grant(&request.user_id, request.amount, request.note)
        .await?;
    let balance = credits.balance(&request.user_id).await.total_remaining;

    info!(
        admin = %principal.user_id,
        user_id = %request.user_id,
        amount = request.amount,
        "Credits granted"
    );

    Ok((
        StatusCode::CREATED,
        Json(GrantResponse {
            allocation,
            balance,
        }),
    ))
}

/// SSE frame for one stream event: `event: <kind>`, `id: <sequence>`.
fn stream_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.kind.as_str())
        .id(event.sequence.to_string())
        .json_data(event)
}

fn primary_events(
    events: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    ReceiverStream::new(events).map(|event| stream_event(&event))
}

fn observer_events(handle: ObserverHandle) -> impl Stream<Item = Result<Event, axum::Error>> {
    handle.into_stream().map(|message| match message {
        ObserverMessage::HistoryStart {
            first_sequence,
            count,
        } => Event::default()
            .event("history-start")
            .json_data(json!({ "first_sequence": first_sequence, "count": count })),
        ObserverMessage::Event(event) => stream_event(&event),
        ObserverMessage::HistoryEnd { next_sequence } => Event::default()
            .event("history-end")
            .json_data(json!({ "next_sequence": next_sequence })),
        ObserverMessage::Dropped => Event::default()
            .event("error")
            .json_data(json!({ "payload": "observer dropped: fell too far behind" })),
    })
}
