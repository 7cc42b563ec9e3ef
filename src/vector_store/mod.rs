//! Reconnect-aware client for the vector store's REST API.
//!
//! Every point carries exactly one named vector (`vs<D>`) and a JSON
//! payload. Read and delete operations always intersect the caller-supplied
//! filter with the allowed space ids; a transport failure closes and reopens
//! the client once and retries the single operation.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::VectorStoreConfig;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vector store rejected the request ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("vector store returned a bad response: {0}")]
    BadResponse(String),
    #[error("invalid vector store url: {0}")]
    BadUrl(#[from] url::ParseError),
}

/// A payload filter, rendered as `{"must": [...]}` clauses.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    must: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_match(mut self, key: &str, value: Value) -> Self {
        self.must.push(json!({ "key": key, "match": { "value": value } }));
        self
    }

    pub fn must_match_any(mut self, key: &str, values: &[String]) -> Self {
        self.must.push(json!({ "key": key, "match": { "any": values } }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({ "must": self.must })
    }
}

#[derive(Debug, Clone)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct RetrievedPoint {
    pub id: Uuid,
    pub payload: Value,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub points: Vec<RetrievedPoint>,
    pub next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    result: Value,
}

pub struct VectorStore {
    base_url: Url,
    collection: String,
    vector_name: String,
    dimension: usize,
    allowed_space_ids: Vec<String>,
    timeout: Duration,
    client: RwLock<reqwest::Client>,
}

impl VectorStore {
    pub fn new(
        config: &VectorStoreConfig,
        dimension: usize,
        allowed_space_ids: Vec<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.url.clone(),
            collection: config.collection.clone(),
            vector_name: format!("vs{dimension}"),
            dimension,
            allowed_space_ids,
            timeout: config.timeout,
            client: RwLock::new(Self::build_client(config.timeout)?),
        })
    }

    fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()
    }

    pub fn vector_name(&self) -> &str {
        &self.vector_name
    }

    pub fn allowed_space_ids(&self) -> &[String] {
        &self.allowed_space_ids
    }

    fn collection_url(&self, suffix: &str) -> Result<Url, VectorStoreError> {
        Ok(self
            .base_url
            .join(&format!("collections/{}{suffix}", self.collection))?)
    }

    /// Intersect a caller filter with the space-id clause.
    fn scoped(&self, filter: Filter) -> Filter {
        filter.must_match_any("space_id", &self.allowed_space_ids)
    }

    fn current_client(&self) -> reqwest::Client {
        self.client.read().expect("client lock").clone()
    }

    fn reconnect(&self) -> Result<(), VectorStoreError> {
        let fresh = Self::build_client(self.timeout)?;
        *self.client.write().expect("client lock") = fresh;
        Ok(())
    }

    /// Run one operation; on a transport error, reopen the client and retry
    /// once. A second failure is surfaced.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, VectorStoreError>
    where
        F: Fn(reqwest::Client) -> Fut,
        Fut: Future<Output = Result<T, VectorStoreError>>,
    {
        match op(self.current_client()).await {
            Err(VectorStoreError::Transport(error)) => {
                warn!(%error, "vector store transport error, reconnecting once");
                self.reconnect()?;
                op(self.current_client()).await
            }
            other => other,
        }
    }

    async fn post_json(
        client: &reqwest::Client,
        url: Url,
        body: &Value,
    ) -> Result<Value, VectorStoreError> {
        let response = client.post(url).json(body).send().await?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value, VectorStoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::Api { status, body });
        }
        let envelope: Envelope = response.json().await?;
        Ok(envelope.result)
    }

    /// Idempotent by point id; at-least-once on retry.
    #[instrument(level = "debug", skip_all, fields(count = points.len()))]
    pub async fn upsert(&self, points: &[Point]) -> Result<(), VectorStoreError> {
        let body = json!({
            "points": points
                .iter()
                .map(|p| {
                    let mut named = serde_json::Map::new();
                    named.insert(self.vector_name.clone(), json!(p.vector));
                    json!({
                        "id": p.id,
                        "vector": Value::Object(named),
                        "payload": p.payload,
                    })
                })
                .collect::<Vec<_>>(),
        });
        let url = self.collection_url("/points?wait=true")?;
        self.with_retry(|client| {
            let url = url.clone();
            let body = body.clone();
            async move {
                let response = client.put(url).json(&body).send().await?;
                Self::unwrap_envelope(response).await?;
                Ok(())
            }
        })
        .await
    }

    /// Similarity search, descending by score.
    #[instrument(level = "debug", skip_all, fields(limit = limit))]
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Filter,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let body = json!({
            "vector": { "name": &self.vector_name, "vector": vector },
            "limit": limit,
            "filter": self.scoped(filter).to_json(),
            "with_payload": true,
        });
        let url = self.collection_url("/points/search")?;
        let result = self
            .with_retry(|client| {
                let url = url.clone();
                let body = body.clone();
                async move { Self::post_json(&client, url, &body).await }
            })
            .await?;

        let hits = result
            .as_array()
            .ok_or_else(|| VectorStoreError::BadResponse("search result is not an array".into()))?;
        hits.iter()
            .map(|hit| {
                Ok(ScoredPoint {
                    id: parse_id(&hit["id"])?,
                    score: hit["score"].as_f64().unwrap_or(0.0) as f32,
                    payload: hit["payload"].clone(),
                })
            })
            .collect()
    }

    /// Paginated filtered read.
    #[instrument(level = "debug", skip_all)]
    pub async fn scroll(
        &self,
        filter: Filter,
        limit: usize,
        offset: Option<Value>,
        with_vector: bool,
    ) -> Result<ScrollPage, VectorStoreError> {
        let mut body = json!({
            "filter": self.scoped(filter).to_json(),
            "limit": limit,
            "with_payload": true,
            "with_vector": with_vector,
        });
        if let Some(offset) = offset {
            body["offset"] = offset;
        }
        let url = self.collection_url("/points/scroll")?;
        let result = self
            .with_retry(|client| {
                let url = url.clone();
                let body = body.clone();
                async move { Self::post_json(&client, url, &body).await }
            })
            .await?;

        let points = result["points"]
            .as_array()
            .ok_or_else(|| VectorStoreError::BadResponse("scroll result has no points".into()))?
            .iter()
            .map(|p| self.parse_point(p))
            .collect::<Result<Vec<_>, _>>()?;
        let next_page_offset = match &result["next_page_offset"] {
            Value::Null => None,
            other => Some(other.clone()),
        };
        Ok(ScrollPage {
            points,
            next_page_offset,
        })
    }

    /// Fetch specific points by id, payload and vector included.
    #[instrument(level = "debug", skip_all, fields(count = ids.len()))]
    pub async fn retrieve(&self, ids: &[Uuid]) -> Result<Vec<RetrievedPoint>, VectorStoreError> {
        let body = json!({
            "ids": ids,
            "with_payload": true,
            "with_vector": true,
        });
        let url = self.collection_url("/points")?;
        let result = self
            .with_retry(|client| {
                let url = url.clone();
                let body = body.clone();
                async move { Self::post_json(&client, url, &body).await }
            })
            .await?;

        result
            .as_array()
            .ok_or_else(|| VectorStoreError::BadResponse("retrieve result is not an array".into()))?
            .iter()
            .map(|p| self.parse_point(p))
            .collect()
    }

    /// Delete by explicit ids.
    #[instrument(level = "debug", skip_all, fields(count = ids.len()))]
    pub async fn delete_ids(&self, ids: &[Uuid]) -> Result<(), VectorStoreError> {
        let body = json!({ "points": ids });
        self.delete_body(body).await
    }

    /// Delete every point matching the filter (space clause included).
    #[instrument(level = "debug", skip_all)]
    pub async fn delete_by_filter(&self, filter: Filter) -> Result<(), VectorStoreError> {
        let body = json!({ "filter": self.scoped(filter).to_json() });
        self.delete_body(body).await
    }

    async fn delete_body(&self, body: Value) -> Result<(), VectorStoreError> {
        let url = self.collection_url("/points/delete?wait=true")?;
        self.with_retry(|client| {
            let url = url.clone();
            let body = body.clone();
            async move {
                Self::post_json(&client, url, &body).await?;
                Ok(())
            }
        })
        .await
    }

    /// Create the collection when absent. Safe to call on every startup.
    pub async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        let url = self.collection_url("")?;
        let client = self.current_client();
        let response = client.get(url.clone()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        info!(collection = %self.collection, "creating vector store collection");
        let mut vectors = serde_json::Map::new();
        vectors.insert(
            self.vector_name.clone(),
            json!({ "size": self.dimension, "distance": "Cosine" }),
        );
        let body = json!({ "vectors": Value::Object(vectors) });
        let response = client.put(url).json(&body).send().await?;
        Self::unwrap_envelope(response).await?;
        Ok(())
    }

    /// Liveness probe against the collection endpoint.
    pub async fn ping(&self) -> Result<(), VectorStoreError> {
        let url = self.collection_url("")?;
        let response = self.current_client().get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(VectorStoreError::Api {
                status,
                body: String::new(),
            })
        }
    }

    fn parse_point(&self, raw: &Value) -> Result<RetrievedPoint, VectorStoreError> {
        let vector = match &raw["vector"] {
            Value::Null => None,
            named => named[self.vector_name.as_str()].as_array().map(|values| {
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            }),
        };
        Ok(RetrievedPoint {
            id: parse_id(&raw["id"])?,
            payload: raw["payload"].clone(),
            vector,
        })
    }
}

fn parse_id(raw: &Value) -> Result<Uuid, VectorStoreError> {
    raw.as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| VectorStoreError::BadResponse(format!("bad point id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_renders_must_clauses() {
        let filter = Filter::new()
            .must_match("chain.id", json!("abc"))
            .must_match_any("space_id", &["app".to_string(), "user".to_string()]);
        let rendered = filter.to_json();
        assert_eq!(rendered["must"][0]["key"], "chain.id");
        assert_eq!(rendered["must"][0]["match"]["value"], "abc");
        assert_eq!(rendered["must"][1]["match"]["any"][1], "user");
    }

    #[test]
    fn empty_filter_still_renders() {
        assert_eq!(Filter::new().to_json()["must"].as_array().unwrap().len(), 0);
        assert!(Filter::new().is_empty());
    }

    #[test]
    fn scoped_filter_appends_space_clause() {
        let config = VectorStoreConfig {
            url: "http://localhost:6333/".parse().unwrap(),
            collection: "kairos".into(),
            timeout: Duration::from_secs(10),
        };
        let store = VectorStore::new(&config, 8, vec!["app".into()]).unwrap();
        let scoped = store.scoped(Filter::new().must_match("task", json!("testing")));
        let rendered = scoped.to_json();
        let clauses = rendered["must"].as_array().unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[1]["key"], "space_id");
        assert_eq!(clauses[1]["match"]["any"][0], "app");
    }

    #[test]
    fn vector_name_tracks_dimension() {
        let config = VectorStoreConfig {
            url: "http://localhost:6333/".parse().unwrap(),
            collection: "kairos".into(),
            timeout: Duration::from_secs(10),
        };
        let store = VectorStore::new(&config, 1536, vec![]).unwrap();
        assert_eq!(store.vector_name(), "vs1536");
    }

    #[test]
    fn point_ids_parse_from_strings_only() {
        assert!(parse_id(&json!("6a31c2f0-8f8b-4a1d-9b6e-0c4f5a7d8e90")).is_ok());
        assert!(parse_id(&json!(42)).is_err());
        assert!(parse_id(&json!("nope")).is_err());
    }
}
