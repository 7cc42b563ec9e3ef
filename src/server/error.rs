use axum::response::IntoResponse;
use axum::Json;
use hyper::StatusCode;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::chain_store::{ChainStoreError, DuplicateItem};
use crate::embedding::EmbeddingError;
use crate::memory::InvalidUri;
use crate::proof::store::KvError;
use crate::search::SearchError;
use crate::vector_store::VectorStoreError;

/// Transport-level errors: everything that surfaces as a non-2xx response.
/// Proof failures below the retry limit are not here; the protocol engine
/// returns those as 200 responses with `must_obey` and `error_code` fields.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),
    #[error("memory not found: {0}")]
    NotFound(String),
    #[error("a chain with this label already exists")]
    DuplicateChain {
        chain_id: Uuid,
        items: Vec<DuplicateItem>,
    },
    #[error("a similar protocol already exists: {existing_label}")]
    SimilarMemoryFound {
        existing_uri: String,
        existing_label: String,
        similarity_score: f32,
    },
    #[error("vector store operation failed: {0}")]
    Store(#[from] VectorStoreError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
    #[error("stored payload is corrupt: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidUri(_) => "INVALID_URI",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateChain { .. } => "DUPLICATE_CHAIN",
            Self::SimilarMemoryFound { .. } => "SIMILAR_MEMORY_FOUND",
            Self::Store(_) => "STORE_FAILED",
            Self::Embedding(_) => "EMBEDDING_FAILED",
            Self::Kv(_) => "KV_FAILED",
            Self::Payload(_) | Self::Other(_) => "INTERNAL",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::InvalidUri(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateChain { .. } | Self::SimilarMemoryFound { .. } => StatusCode::CONFLICT,
            Self::Embedding(_) | Self::Kv(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Payload(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ChainStoreError> for Error {
    fn from(error: ChainStoreError) -> Self {
        match error {
            ChainStoreError::Duplicate { chain_id, items } => {
                Self::DuplicateChain { chain_id, items }
            }
            ChainStoreError::SimilarMemory {
                existing_uri,
                existing_label,
                similarity_score,
            } => Self::SimilarMemoryFound {
                existing_uri,
                existing_label,
                similarity_score,
            },
            ChainStoreError::NotFound(uri) => Self::NotFound(uri),
            ChainStoreError::Store(inner) => Self::Store(inner),
            ChainStoreError::Payload(inner) => Self::Payload(inner),
        }
    }
}

impl From<SearchError> for Error {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::Embedding(inner) => Self::Embedding(inner),
            SearchError::Store(inner) => Self::Store(inner),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code();
        let body = match &self {
            Self::DuplicateChain { chain_id, items } => json!({
                "error_code": self.error_code(),
                "message": self.to_string(),
                "chain_id": chain_id,
                "items": items
                    .iter()
                    .map(|item| json!({ "label": item.label, "uri": item.uri }))
                    .collect::<Vec<_>>(),
            }),
            Self::SimilarMemoryFound {
                existing_uri,
                existing_label,
                similarity_score,
            } => json!({
                "error_code": self.error_code(),
                "message": self.to_string(),
                "existing_memory": { "uri": existing_uri, "label": existing_label },
                "similarity_score": similarity_score,
                "must_obey": true,
                "next_action": format!("call kairos_begin with {existing_uri}"),
            }),
            _ => json!({
                "error_code": self.error_code(),
                "message": self.to_string(),
            }),
        };

        (status_code, Json(body)).into_response()
    }
}
