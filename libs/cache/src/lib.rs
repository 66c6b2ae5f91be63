//! Flat TTL cache in front of MongoDB reads.
//!
//! Values are stored as JSON strings under a namespaced key. Writers delete
//! the key; readers repopulate it on the next miss.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::warn;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn put_raw(&self, key: &str, value: String, ttl_s: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub type SharedCache = Arc<dyn Cache>;

/// Typed read helper. Decode failures are treated as misses so a schema
/// change never wedges the cache.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>> {
    match cache.get_raw(key).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, error = %err, "dropping undecodable cache entry");
                cache.delete(key).await.ok();
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl_s: u64,
) -> Result<()> {
    cache.put_raw(key, serde_json::to_string(value)?, ttl_s).await
}

pub struct RedisCache {
    namespace: String,
    // ConnectionManager multiplexes; clone per call instead of locking.
    connection: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            namespace: namespace.into(),
            connection: manager,
        })
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.namespace, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.cache_key(key)).await?;
        Ok(value)
    }

    async fn put_raw(&self, key: &str, value: String, ttl_s: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(self.cache_key(key), value, ttl_s.max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.cache_key(key)).await?;
        Ok(())
    }
}

/// Process-local cache for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryCache {
    inner: RwLock<std::collections::HashMap<String, (String, OffsetDateTime)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let guard = self.inner.read().await;
        Ok(guard.get(key).and_then(|(value, expires)| {
            if *expires > OffsetDateTime::now_utc() {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn put_raw(&self, key: &str, value: String, ttl_s: u64) -> Result<()> {
        let expires = OffsetDateTime::now_utc() + time::Duration::seconds(ttl_s.max(1) as i64);
        self.inner
            .write()
            .await
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_roundtrip_and_invalidate() {
        let cache = InMemoryCache::new();
        put_json(&cache, "k", &vec![1u32, 2, 3], 60).await.unwrap();
        let hit: Option<Vec<u32>> = get_json(&cache, "k").await.unwrap();
        assert_eq!(hit, Some(vec![1, 2, 3]));

        cache.delete("k").await.unwrap();
        let miss: Option<Vec<u32>> = get_json(&cache, "k").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn undecodable_entries_read_as_miss() {
        let cache = InMemoryCache::new();
        cache.put_raw("bad", "not-json{".into(), 60).await.unwrap();
        let miss: Option<Vec<u32>> = get_json(&cache, "bad").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let cache = InMemoryCache::new();
        cache
            .inner
            .write()
            .await
            .insert(
                "old".into(),
                (
                    "\"v\"".into(),
                    OffsetDateTime::now_utc() - time::Duration::seconds(1),
                ),
            );
        let miss: Option<String> = get_json(&cache, "old").await.unwrap();
        assert!(miss.is_none());
    }
}
