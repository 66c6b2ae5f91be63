//! Event deduplication backed by Redis `SET NX EX`.
//!
//! Both the live webhook path and the backtrack replay register every event
//! here before dispatching, which is what makes their overlap safe.

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

/// Composite idempotency key per account/surface/event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdKey {
    pub account: String,
    pub surface: String,
    pub event_id: String,
}

impl Display for IdKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.account, self.surface, self.event_id)
    }
}

/// Contract implemented by idempotency stores.
#[async_trait]
pub trait IdemStore: Send + Sync {
    /// Attempts to register `key` with the provided TTL. Returns `Ok(true)`
    /// when the key did not previously exist (the caller should continue),
    /// `Ok(false)` for a duplicate, or an error when the store was down.
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool>;
}

pub type SharedIdemStore = Arc<dyn IdemStore>;

/// In-memory store used in tests or when Redis is not configured.
#[derive(Clone, Default)]
pub struct InMemoryIdemStore {
    inner: Arc<RwLock<std::collections::HashMap<String, OffsetDateTime>>>,
}

impl InMemoryIdemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let mut guard = self.inner.write().await;
        guard.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl IdemStore for InMemoryIdemStore {
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let ttl = Duration::seconds(ttl_s as i64);
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some(exp) if *exp > now => Ok(false),
            _ => {
                guard.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

/// Redis-backed store. `SET key NX EX ttl` is atomic, so concurrent ingress
/// workers agree on which sighting was first.
pub struct RedisIdemStore {
    namespace: String,
    // ConnectionManager multiplexes; clone per call instead of locking.
    connection: redis::aio::ConnectionManager,
}

impl RedisIdemStore {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            namespace: namespace.into(),
            connection: manager,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.namespace, key)
    }
}

#[async_trait]
impl IdemStore for RedisIdemStore {
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let full = self.full_key(key);
        let mut conn = self.connection.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&full)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_s.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}

/// Configuration derived at runtime.
#[derive(Clone)]
pub struct IdempotencyConfig {
    pub ttl_hours: u64,
    pub namespace: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 36,
            namespace: "gramflow".to_string(),
        }
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(ttl) = std::env::var("IDEMPOTENCY_TTL_HOURS") {
            if let Ok(parsed) = ttl.parse::<u64>() {
                cfg.ttl_hours = parsed.max(1);
            }
        }
        if let Ok(ns) = std::env::var("IDEMPOTENCY_NAMESPACE") {
            if !ns.trim().is_empty() {
                cfg.namespace = ns;
            }
        }
        cfg
    }
}

/// Guard used by event handlers to deduplicate comments and DMs.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ttl_secs: u64,
    store: SharedIdemStore,
}

impl IdempotencyGuard {
    pub fn new(store: SharedIdemStore, ttl_hours: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_hours.saturating_mul(3600).max(60),
        }
    }

    /// Returns `Ok(true)` when the caller should proceed (first sighting).
    pub async fn should_process(&self, key: &IdKey) -> Result<bool> {
        let inserted = self
            .store
            .put_if_absent(&key.to_string(), self.ttl_secs)
            .await?;
        if !inserted {
            warn!(account = %key.account, surface = %key.surface, event_id = %key.event_id, "duplicate event dropped");
            metrics::counter!(
                "idempotency_hit",
                "account" => key.account.clone(),
                "surface" => key.surface.clone()
            )
            .increment(1);
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    async fn memory_store_dedupes() {
        let store = InMemoryIdemStore::new();
        assert!(store.put_if_absent("k", 10).await.unwrap());
        assert!(!store.put_if_absent("k", 10).await.unwrap());
        store.inner.write().await.insert(
            "expired".into(),
            OffsetDateTime::now_utc() - Duration::seconds(5),
        );
        assert!(store.put_if_absent("expired", 1).await.unwrap());
    }

    #[tokio::test]
    async fn guard_should_process_once() {
        let store: SharedIdemStore = Arc::new(InMemoryIdemStore::new());
        let guard = IdempotencyGuard::new(store, 1);
        let key = IdKey {
            account: "acct".into(),
            surface: "comments".into(),
            event_id: "c-1".into(),
        };
        assert!(guard.should_process(&key).await.unwrap());
        assert!(!guard.should_process(&key).await.unwrap());
    }

    #[test]
    fn key_display_is_colon_separated() {
        let key = IdKey {
            account: "a".into(),
            surface: "dm".into(),
            event_id: "m1".into(),
        };
        assert_eq!(key.to_string(), "a:dm:m1");
    }
}
