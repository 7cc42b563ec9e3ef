//! TTL'd per-step proof state: nonce, proof hash, retry counter and the last
//! result record, all keyed by the step's memory uuid.
//!
//! The store is not authoritative; entries are created lazily on begin/next
//! and expire by TTL. Backends hide the transport: Redis in production, an
//! in-memory map in tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const NONCE_TTL: Duration = Duration::from_secs(60 * 60);
pub const HASH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const RETRY_TTL: Duration = Duration::from_secs(60 * 60);
pub const RESULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("kv serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Minimal expiring-KV surface the proof store needs.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    /// Increment, refresh the TTL, return the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u32, KvError>;
    async fn ping(&self) -> Result<(), KvError>;
}

/// Redis-backed store used in production.
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        Ok(con.get::<_, Option<String>>(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u32, KvError> {
        let mut con = self.manager.clone();
        let value: u32 = con.incr(key, 1u32).await?;
        con.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.get::<_, Option<String>>("pow:ping").await?;
        Ok(())
    }
}

/// In-memory backend with lazy expiry. Used by tests and as a degraded
/// fallback when no KV url is configured.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("kv mutex");
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.entries
            .lock()
            .expect("kv mutex")
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.live(key))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().expect("kv mutex").remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u32, KvError> {
        let current = self
            .live(key)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let next = current + 1;
        self.set_ex(key, &next.to_string(), ttl).await?;
        Ok(next)
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Outcome record persisted after a solved challenge or an attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub quality_bonus: f64,
    pub recorded_at: DateTime<Utc>,
}

pub struct ProofStore {
    kv: std::sync::Arc<dyn KvBackend>,
}

impl ProofStore {
    pub fn new(kv: std::sync::Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    fn key(kind: &str, id: Uuid) -> String {
        format!("pow:{kind}:{id}")
    }

    pub async fn put_nonce(&self, id: Uuid, nonce: &str) -> Result<(), KvError> {
        self.kv.set_ex(&Self::key("nonce", id), nonce, NONCE_TTL).await
    }

    pub async fn nonce(&self, id: Uuid) -> Result<Option<String>, KvError> {
        self.kv.get(&Self::key("nonce", id)).await
    }

    pub async fn put_hash(&self, id: Uuid, hash: &str) -> Result<(), KvError> {
        self.kv.set_ex(&Self::key("hash", id), hash, HASH_TTL).await
    }

    pub async fn hash(&self, id: Uuid) -> Result<Option<String>, KvError> {
        self.kv.get(&Self::key("hash", id)).await
    }

    pub async fn reset_retries(&self, id: Uuid) -> Result<(), KvError> {
        self.kv.del(&Self::key("retry", id)).await
    }

    pub async fn bump_retry(&self, id: Uuid) -> Result<u32, KvError> {
        self.kv.incr(&Self::key("retry", id), RETRY_TTL).await
    }

    pub async fn retry_count(&self, id: Uuid) -> Result<u32, KvError> {
        Ok(self
            .kv
            .get(&Self::key("retry", id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn put_result(&self, id: Uuid, record: &ResultRecord) -> Result<(), KvError> {
        let raw = serde_json::to_string(record)?;
        self.kv.set_ex(&Self::key("result", id), &raw, RESULT_TTL).await
    }

    pub async fn result(&self, id: Uuid) -> Result<Option<ResultRecord>, KvError> {
        match self.kv.get(&Self::key("result", id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn ping(&self) -> Result<(), KvError> {
        self.kv.ping().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn store() -> ProofStore {
        ProofStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn nonce_round_trip() {
        let store = store();
        let id = Uuid::new_v4();
        assert_eq!(store.nonce(id).await.unwrap(), None);
        store.put_nonce(id, "abcd").await.unwrap();
        assert_eq!(store.nonce(id).await.unwrap().as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn retries_bump_and_reset() {
        let store = store();
        let id = Uuid::new_v4();
        assert_eq!(store.retry_count(id).await.unwrap(), 0);
        assert_eq!(store.bump_retry(id).await.unwrap(), 1);
        assert_eq!(store.bump_retry(id).await.unwrap(), 2);
        assert_eq!(store.retry_count(id).await.unwrap(), 2);
        store.reset_retries(id).await.unwrap();
        assert_eq!(store.retry_count(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn result_record_round_trip() {
        let store = store();
        let id = Uuid::new_v4();
        let record = ResultRecord {
            outcome: "success".into(),
            message: Some("done".into()),
            quality_bonus: 2.0,
            recorded_at: Utc::now(),
        };
        store.put_result(id, &record).await.unwrap();
        let loaded = store.result(id).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, "success");
        assert_eq!(loaded.quality_bonus, 2.0);
    }

    #[tokio::test]
    async fn memory_kv_expires_entries() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keyspace_is_separated_per_step() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put_nonce(a, "na").await.unwrap();
        store.put_hash(a, "ha").await.unwrap();
        assert_eq!(store.nonce(b).await.unwrap(), None);
        assert_eq!(store.hash(b).await.unwrap(), None);
    }
}
