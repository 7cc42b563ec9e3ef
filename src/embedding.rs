//! Client for the embedding provider.
//!
//! The contract is batch-in, vectors-out: `POST {url}/embed` with
//! `{"input": [...]}` returns `{"embeddings": [[f32; D], ...]}`. Failures
//! are surfaced as errors; the zero-vector fallback policy belongs to the
//! caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::EmbeddingConfig;

const EMBED_ENDPOINT: &str = "embed";

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("embedding provider returned a bad response: {0}")]
    BadResponse(String),
    #[error("invalid embedding url: {0}")]
    BadUrl(#[from] url::ParseError),
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Clone, Debug)]
pub struct EmbeddingClient {
    target_url: Url,
    client: reqwest::Client,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            target_url: config.url.clone(),
            client,
            dimension: config.dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Name of the single named vector every point carries: `vs<D>`.
    pub fn vector_name(&self) -> String {
        format!("vs{}", self.dimension)
    }

    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dimension]
    }

    /// One dense vector per input string, in order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let response = self
            .client
            .post(self.target_url.join(EMBED_ENDPOINT)?)
            .json(&EmbedRequest { input: texts })
            .send()
            .await?
            .error_for_status()?;

        let body: EmbedResponse = response.json().await?;

        if body.embeddings.len() != texts.len() {
            return Err(EmbeddingError::BadResponse(format!(
                "{} vectors for {} inputs",
                body.embeddings.len(),
                texts.len()
            )));
        }
        if let Some(vector) = body.embeddings.iter().find(|v| v.len() != self.dimension) {
            return Err(EmbeddingError::BadResponse(format!(
                "vector of dimension {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }

        Ok(body.embeddings)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::BadResponse("empty batch".to_string()))
    }

    /// Transport-level liveness probe.
    pub async fn ping(&self) -> Result<(), EmbeddingError> {
        self.client
            .get(self.target_url.join("health")?)
            .send()
            .await?;
        Ok(())
    }
}
