//! Request logging middleware.

use crate::identity::USER_ID_HEADER;
use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{debug, warn};

/// Log every request with its outcome and latency.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let user = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let start = std::time::Instant::now();

    debug!(%method, %uri, %user, "Request started");

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_success() {
        debug!(%method, %uri, %user, %status, ?duration, "Request completed");
    } else {
        warn!(%method, %uri, %user, %status, ?duration, "Request failed");
    }

    response
}
