// Shared between the integration test crates; not every helper is used by
// every crate.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use kairos::app::App;
use kairos::config::Config;
use kairos::elicit::Elicitor;
use kairos::server;
use kairos::shutdown::Shutdown;
use serde_json::{json, Value};
use uuid::Uuid;

/// One running kairos instance wired to in-process mock upstreams.
pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    shutdown: Shutdown,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}, None).await
}

pub async fn spawn_app_with(
    tweak: impl FnOnce(&mut Config),
    elicitor: Option<Arc<dyn Elicitor>>,
) -> TestApp {
    let store_addr = spawn_mock_vector_store().await;
    let embed_addr = spawn_mock_embedding(64).await;

    let mut config = Config::default();
    config.vector_store.url = format!("http://{store_addr}/").parse().unwrap();
    config.embedding.url = format!("http://{embed_addr}/").parse().unwrap();
    config.embedding.dimension = 64;
    config.kv.url = None;
    // The one-hot mock embedding makes every same-titled document identical;
    // the guard is exercised by the tests that opt back in.
    config.app.similarity_guard_threshold = None;
    tweak(&mut config);

    let server_config = config.server.clone();
    let app = match elicitor {
        Some(elicitor) => App::new_with_elicitor(config, elicitor).await.unwrap(),
        None => App::new(config).await.unwrap(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server::bind_from_listener(app, server_config.serve_timeout, listener, serve_shutdown)
            .await
            .unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        shutdown,
    }
}

// ---------------------------------------------------------------------------
// Mock vector store: the five REST operations over an in-memory map, with
// cosine scoring and `must` filter support.
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MockStore {
    points: Arc<Mutex<HashMap<Uuid, (Vec<f32>, Value)>>>,
}

pub async fn spawn_mock_vector_store() -> SocketAddr {
    let store = MockStore::default();

    let router = Router::new()
        .route(
            "/collections/:collection",
            get(|| async { Json(json!({ "result": {} })) })
                .put(|| async { Json(json!({ "result": true })) }),
        )
        .route(
            "/collections/:collection/points",
            put(upsert_points).post(retrieve_points),
        )
        .route("/collections/:collection/points/search", post(search_points))
        .route("/collections/:collection/points/scroll", post(scroll_points))
        .route("/collections/:collection/points/delete", post(delete_points))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn upsert_points(
    Path(_collection): Path<String>,
    State(store): State<MockStore>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut points = store.points.lock().unwrap();
    for point in body["points"].as_array().cloned().unwrap_or_default() {
        let id: Uuid = point["id"].as_str().unwrap().parse().unwrap();
        let vector = point["vector"]
            .as_object()
            .and_then(|named| named.values().next())
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            })
            .unwrap_or_default();
        points.insert(id, (vector, point["payload"].clone()));
    }
    Json(json!({ "result": { "status": "completed" } }))
}

async fn retrieve_points(
    Path(_collection): Path<String>,
    State(store): State<MockStore>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let points = store.points.lock().unwrap();
    let result: Vec<Value> = body["ids"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| raw.as_str().and_then(|s| s.parse::<Uuid>().ok()))
        .filter_map(|id| {
            points.get(&id).map(|(vector, payload)| {
                json!({
                    "id": id,
                    "payload": payload,
                    "vector": { "vs64": vector },
                })
            })
        })
        .collect();
    Json(json!({ "result": result }))
}

async fn search_points(
    Path(_collection): Path<String>,
    State(store): State<MockStore>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let query: Vec<f32> = body["vector"]["vector"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();
    let limit = body["limit"].as_u64().unwrap_or(10) as usize;
    let filter = body["filter"].clone();

    let points = store.points.lock().unwrap();
    let mut hits: Vec<(Uuid, f32, Value)> = points
        .iter()
        .filter(|(_, (_, payload))| matches_filter(payload, &filter))
        .map(|(id, (vector, payload))| (*id, cosine(&query, vector), payload.clone()))
        .collect();
    hits.sort_by(|a, b| b.1.total_cmp(&a.1));
    hits.truncate(limit);

    let result: Vec<Value> = hits
        .into_iter()
        .map(|(id, score, payload)| json!({ "id": id, "score": score, "payload": payload }))
        .collect();
    Json(json!({ "result": result }))
}

async fn scroll_points(
    Path(_collection): Path<String>,
    State(store): State<MockStore>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let filter = body["filter"].clone();
    let limit = body["limit"].as_u64().unwrap_or(100) as usize;
    let with_vector = body["with_vector"].as_bool().unwrap_or(false);

    let points = store.points.lock().unwrap();
    let result: Vec<Value> = points
        .iter()
        .filter(|(_, (_, payload))| matches_filter(payload, &filter))
        .take(limit)
        .map(|(id, (vector, payload))| {
            if with_vector {
                json!({ "id": id, "payload": payload, "vector": { "vs64": vector } })
            } else {
                json!({ "id": id, "payload": payload })
            }
        })
        .collect();
    Json(json!({ "result": { "points": result, "next_page_offset": null } }))
}

async fn delete_points(
    Path(_collection): Path<String>,
    State(store): State<MockStore>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut points = store.points.lock().unwrap();
    if let Some(ids) = body["points"].as_array() {
        for raw in ids {
            if let Some(id) = raw.as_str().and_then(|s| s.parse::<Uuid>().ok()) {
                points.remove(&id);
            }
        }
    } else {
        let filter = body["filter"].clone();
        points.retain(|_, (_, payload)| !matches_filter(payload, &filter));
    }
    Json(json!({ "result": { "status": "completed" } }))
}

/// Interpret `{"must": [{key, match: {value | any}}]}` against a payload.
fn matches_filter(payload: &Value, filter: &Value) -> bool {
    let Some(clauses) = filter["must"].as_array() else {
        return true;
    };
    clauses.iter().all(|clause| {
        let Some(key) = clause["key"].as_str() else {
            return false;
        };
        let actual = lookup(payload, key);
        if let Some(expected) = clause["match"].get("value") {
            actual == Some(expected)
        } else if let Some(any) = clause["match"]["any"].as_array() {
            actual.map(|a| any.contains(a)).unwrap_or(false)
        } else {
            false
        }
    })
}

fn lookup<'a>(payload: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = payload;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ---------------------------------------------------------------------------
// Mock embedding provider: one-hot on the first non-empty line, so two
// documents embed identically exactly when their titles agree.
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MockEmbedder {
    dims: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockEmbedder {
    fn dim_for(&self, text: &str) -> usize {
        let title = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_lowercase();
        let mut dims = self.dims.lock().unwrap();
        let next = dims.len();
        *dims.entry(title).or_insert(next)
    }
}

pub async fn spawn_mock_embedding(dimension: usize) -> SocketAddr {
    let embedder = MockEmbedder::default();

    let embed = move |State(embedder): State<MockEmbedder>, Json(body): Json<Value>| async move {
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let embeddings: Vec<Vec<f32>> = inputs
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; dimension];
                let dim = embedder.dim_for(text.as_str().unwrap_or(""));
                vector[dim % dimension] = 1.0;
                vector
            })
            .collect();
        Json(json!({ "embeddings": embeddings }))
    };

    let router = Router::new()
        .route("/embed", post(embed))
        .route("/health", get(|| async { "ok" }))
        .with_state(embedder);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn mint(app: &TestApp, markdown: &str, force: bool) -> reqwest::Response {
    let url = if force {
        app.url("/api/kairos_mint/raw?force=true")
    } else {
        app.url("/api/kairos_mint/raw")
    };
    app.client
        .post(url)
        .header("content-type", "text/markdown")
        .header("x-llm-model-id", "test-agent")
        .body(markdown.to_string())
        .send()
        .await
        .unwrap()
}

pub async fn mint_ok(app: &TestApp, markdown: &str) -> Value {
    let response = mint(app, markdown, false).await;
    assert_eq!(response.status(), 200, "mint failed");
    response.json().await.unwrap()
}

pub async fn post_json(app: &TestApp, path: &str, body: Value) -> reqwest::Response {
    app.client
        .post(app.url(path))
        .json(&body)
        .send()
        .await
        .unwrap()
}
