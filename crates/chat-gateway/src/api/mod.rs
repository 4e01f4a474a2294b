//! HTTP API for the gateway.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::logging_middleware;
pub use types::*;

use crate::orchestrator::SessionOrchestrator;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use provider_bridge::ProviderFamily;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle façade
    pub orchestrator: SessionOrchestrator,
    /// Provider families with credentials, for health reporting
    pub providers: Vec<ProviderFamily>,
}

impl AppState {
    pub fn new(orchestrator: SessionOrchestrator, providers: Vec<ProviderFamily>) -> Self {
        Self {
            orchestrator,
            providers,
        }
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Streaming
        .route("/v1/chat/stream", post(handlers::chat_stream))
        // Supervision
        .route("/v1/sessions/active", get(handlers::active_sessions))
        .route("/v1/sessions/:id", get(handlers::get_session))
        .route("/v1/sessions/:id/observe", get(handlers::observe_session))
        // Credits
        .route("/v1/credits/balance", get(handlers::balance))
        .route("/v1/credits/usage", get(handlers::usage))
        .route("/v1/pricing/:model", get(handlers::pricing))
        .route("/v1/admin/credits", post(handlers::grant_credits))
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
