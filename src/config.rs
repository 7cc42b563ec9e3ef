use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flat, spec-pinned environment variables and the config keys they
/// override. `PORT` and `METRICS_PORT` are handled separately because they
/// expand into socket addresses.
const FLAT_ENV: &[(&str, &str)] = &[
    ("VECTOR_STORE_URL", "vector_store.url"),
    ("VECTOR_COLLECTION", "vector_store.collection"),
    ("KV_URL", "kv.url"),
    ("EMBEDDING_URL", "embedding.url"),
    ("EMBEDDING_DIMENSION", "embedding.dimension"),
    ("KAIROS_APP_SPACE_ID", "app.space_id"),
    ("SCORE_THRESHOLD", "app.score_threshold"),
    ("MATCH_THRESHOLD", "app.match_threshold"),
    ("LOG_LEVEL", "service.log_level"),
    ("LOG_FORMAT", "service.log_format"),
];

pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    settings = settings.add_source(
        config::Environment::with_prefix("KAIROS")
            .separator("__")
            .try_parsing(true),
    );

    for (env, key) in FLAT_ENV {
        settings = settings.set_override_option(*key, std::env::var(env).ok())?;
    }
    if let Ok(port) = std::env::var("PORT") {
        settings = settings.set_override("server.address", format!("0.0.0.0:{port}"))?;
    }
    if let Ok(port) = std::env::var("METRICS_PORT") {
        settings = settings.set_override("server.metrics_address", format!("0.0.0.0:{port}"))?;
    }

    Ok(settings.build()?.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub vector_store: VectorStoreConfig,
    pub kv: KvConfig,
    pub embedding: EmbeddingConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Space tag written on every minted point.
    pub space_id: String,

    /// Additional space ids readable by this deployment.
    pub extra_space_ids: Vec<String>,

    /// Minimum similarity for a search hit to be offered at all.
    pub score_threshold: f32,

    /// Similarity at and above which a hit counts as a perfect match.
    pub match_threshold: f32,

    /// Cosine threshold for the similar-title mint guard; unset disables
    /// the guard.
    pub similarity_guard_threshold: Option<f32>,

    /// Raw hits fetched per search before chain grouping.
    pub search_limit: usize,

    /// Consecutive proof failures tolerated before the circuit opens.
    pub max_retries: u32,

    /// The duration to wait for in-flight requests when shutting down.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl AppConfig {
    /// Spaces visible to read operations.
    pub fn allowed_space_ids(&self) -> Vec<String> {
        let mut spaces = vec![self.space_id.clone()];
        spaces.extend(self.extra_space_ids.iter().cloned());
        spaces
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            space_id: default::space_id(),
            extra_space_ids: Vec::new(),
            score_threshold: default::score_threshold(),
            match_threshold: default::match_threshold(),
            similarity_guard_threshold: default::similarity_guard_threshold(),
            search_limit: default::search_limit(),
            max_retries: default::max_retries(),
            shutdown_timeout: default::shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,

    /// Dedicated port for Prometheus exposition.
    pub metrics_address: SocketAddr,

    #[serde(with = "humantime_serde")]
    pub serve_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub elicitation_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default::address(),
            metrics_address: default::metrics_address(),
            serve_timeout: default::serve_timeout(),
            elicitation_timeout: default::elicitation_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub url: Url,
    pub collection: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default::vector_store_url(),
            collection: default::collection(),
            timeout: default::vector_store_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KvConfig {
    /// Redis connection url. Unset falls back to the in-process store and
    /// proof state will not survive a restart.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub url: Url,
    pub dimension: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default::embedding_url(),
            dimension: default::dimension(),
            timeout: default::embedding_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    // Service name - used for logging and metrics
    pub service_name: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default::service_name(),
            log_level: default::log_level(),
            log_format: LogFormat::default(),
        }
    }
}

pub mod default {
    use std::net::SocketAddr;
    use std::time::Duration;

    use url::Url;

    pub fn service_name() -> String {
        "kairos".to_string()
    }

    pub fn log_level() -> String {
        "info".to_string()
    }

    pub fn space_id() -> String {
        "app".to_string()
    }

    pub fn score_threshold() -> f32 {
        0.7
    }

    pub fn match_threshold() -> f32 {
        0.95
    }

    pub fn similarity_guard_threshold() -> Option<f32> {
        Some(0.92)
    }

    pub fn search_limit() -> usize {
        15
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn address() -> SocketAddr {
        "0.0.0.0:3000".parse().expect("default address")
    }

    pub fn metrics_address() -> SocketAddr {
        "0.0.0.0:9090".parse().expect("default metrics address")
    }

    pub fn serve_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn elicitation_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn vector_store_url() -> Url {
        "http://127.0.0.1:6333/"
            .parse()
            .expect("default vector store url")
    }

    pub fn collection() -> String {
        "kairos_memories".to_string()
    }

    pub fn vector_store_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn embedding_url() -> Url {
        "http://127.0.0.1:8890/"
            .parse()
            .expect("default embedding url")
    }

    pub fn dimension() -> usize {
        768
    }

    pub fn embedding_timeout() -> Duration {
        Duration::from_secs(5)
    }
}
