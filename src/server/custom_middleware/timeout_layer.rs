use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

/// Slack before the hard deadline at which slow requests are logged.
const WARN_MARGIN: Duration = Duration::from_secs(5);

pub async fn middleware(
    State(timeout_duration): State<Duration>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let started = Instant::now();
    let warn_at = timeout_duration.saturating_sub(WARN_MARGIN);

    let result = tokio::time::timeout(timeout_duration, next.run(request)).await;

    let elapsed = started.elapsed();
    if elapsed > warn_at {
        warn!(?elapsed, ?timeout_duration, "slow request");
    }

    match result {
        Ok(response) => Ok(response),
        Err(_elapsed) => Err(StatusCode::REQUEST_TIMEOUT),
    }
}
