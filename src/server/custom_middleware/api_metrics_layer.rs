use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use prometheus::{register_histogram, Histogram};

use crate::monitoring;

static LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("api_latency_seconds", "The API latency in seconds.").unwrap()
});

pub async fn middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let _timer = LATENCY.start_timer(); // Observes on drop
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    monitoring::API_REQUESTS
        .with_label_values(&[&path, response.status().as_str()])
        .inc();

    Ok(response)
}
