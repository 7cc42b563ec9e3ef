pub mod data;
pub mod error;

mod custom_middleware;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use error::Error;
use hyper::StatusCode;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use self::data::{
    AttestRequest, AttestResponse, BeginRequest, BeginResponse, DeleteRequest, DeleteResponse,
    DumpRequest, DumpResponse, HealthResponse, MintResponse, NextRequest, NextResponse,
    SearchRequest, UpdateRequest, UpdateResponse,
};
use crate::app::App;
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::search::SearchResponse;
use crate::shutdown::Shutdown;

fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext {
        llm_model_id: headers
            .get("x-llm-model-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string),
        elicitation_supported: headers
            .get("x-elicitation-capability")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

#[derive(Debug, Deserialize)]
struct MintQuery {
    #[serde(default)]
    force: Option<bool>,
}

async fn mint_raw(
    State(app): State<Arc<App>>,
    Query(query): Query<MintQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<MintResponse>), Error> {
    let ctx = request_context(&headers);
    let force_update = query.force.unwrap_or(false)
        || headers
            .get("x-force-update")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

    let result = app.mint(&ctx, &body, force_update).await?;

    Ok((StatusCode::OK, Json(result)))
}

async fn search(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.search(&ctx, &request.query).await?;

    Ok(Json(result))
}

async fn begin(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<BeginRequest>,
) -> Result<Json<BeginResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.begin(&ctx, &request.uri).await?;

    Ok(Json(result))
}

async fn next(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<NextRequest>,
) -> Result<Json<NextResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.next(&ctx, request).await?;

    Ok(Json(result))
}

async fn attest(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<AttestRequest>,
) -> Result<Json<AttestResponse>, Error> {
    let mut ctx = request_context(&headers);
    if ctx.llm_model_id.is_none() {
        ctx.llm_model_id = request.llm_model_id.clone();
    }
    let result = app.attest(&ctx, &request).await?;

    Ok(Json(result))
}

async fn update(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.update(&ctx, &request).await?;

    Ok(Json(result))
}

async fn delete(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.delete(&ctx, &request).await?;

    Ok(Json(result))
}

async fn dump(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(request): Json<DumpRequest>,
) -> Result<Json<DumpResponse>, Error> {
    let ctx = request_context(&headers);
    let result = app.dump(&ctx, &request).await?;

    Ok(Json(result))
}

async fn health(
    State(app): State<Arc<App>>,
) -> Result<(StatusCode, Json<HealthResponse>), Error> {
    let result = app.health().await;
    let status = if result.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    Ok((status, Json(result)))
}

/// Static RFC 9728 protected-resource document, reachable without
/// credentials.
async fn oauth_protected_resource() -> Json<serde_json::Value> {
    Json(json!({
        "resource": "kairos",
        "bearer_methods_supported": ["header"],
        "scopes_supported": [],
    }))
}

async fn metrics() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Other(e.into()))?;

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error::Other(e.into()))?;

    Ok(response)
}

pub fn router(app: Arc<App>, serve_timeout: Duration) -> Router {
    Router::new()
        .route("/api/kairos_mint/raw", post(mint_raw))
        .route("/api/kairos_search", post(search))
        .route("/api/kairos_begin", post(begin))
        .route("/api/kairos_next", post(next))
        .route("/api/kairos_attest", post(attest))
        .route("/api/kairos_update", post(update))
        .route("/api/kairos_delete", post(delete))
        .route("/api/kairos_dump", post(dump))
        .route("/health", get(health))
        .route(
            "/.well-known/oauth-protected-resource",
            get(oauth_protected_resource),
        )
        .route(
            "/.well-known/oauth-protected-resource/mcp",
            get(oauth_protected_resource),
        )
        .layer(middleware::from_fn(
            custom_middleware::api_metrics_layer::middleware,
        ))
        .layer(middleware::from_fn_with_state(
            serve_timeout,
            custom_middleware::timeout_layer::middleware,
        ))
        .layer(middleware::from_fn(
            custom_middleware::logging_layer::middleware,
        ))
        .with_state(app)
}

/// # Errors
///
/// Will return `Err` if the server cannot bind to the configured address.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = TcpListener::bind(config.address).await?;

    bind_from_listener(app, config.serve_timeout, listener, shutdown).await?;

    Ok(())
}

/// # Errors
///
/// Will return `Err` if the server fails to serve from the given listener.
pub async fn bind_from_listener(
    app: Arc<App>,
    serve_timeout: Duration,
    listener: TcpListener,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let router = router(app, serve_timeout);

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.await_shutdown().await });

    server.await?;

    Ok(())
}

/// Prometheus exposition on its own port.
pub async fn run_metrics(address: SocketAddr, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Metrics will listen on {}", address);
    let router = Router::new().route("/metrics", get(metrics));
    let listener = TcpListener::bind(address).await?;

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.await_shutdown().await });

    server.await?;

    Ok(())
}
