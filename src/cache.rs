use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache tier shared by every gateway instance (Redis in production).
#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl SharedTier for ConnectionManager {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.clone();
        Ok(AsyncCommands::get::<_, Option<String>>(&mut conn, key).await?)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> anyhow::Result<()> {
        let mut conn = self.clone();
        AsyncCommands::set_ex::<_, _, ()>(&mut conn, key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.clone();
        AsyncCommands::del::<_, ()>(&mut conn, key).await?;
        Ok(())
    }
}

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Instant,
}

/// Token cache in front of PG (the source of truth, handled by callers).
///
/// With a shared tier every read and write goes through it, so a delete on
/// one instance is seen by all of them on the next read. Without one the
/// cache is an in-process DashMap with the full TTL, which is what tests
/// and single-instance development use.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    shared: Option<Arc<dyn SharedTier>>,
}

impl TieredCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_shared(Arc::new(redis))
    }

    pub fn with_shared(shared: Arc<dyn SharedTier>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            shared: Some(shared),
        }
    }

    pub fn local_only() -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            shared: None,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match &self.shared {
            Some(shared) => match shared.get(key).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(key_prefix = key_prefix(key), "shared cache get failed: {}", e);
                    None
                }
            },
            None => self.get_local(key),
        }?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        match &self.shared {
            Some(shared) => shared.set_ex(key, json, ttl_secs).await,
            None => {
                self.local.insert(
                    key.to_string(),
                    CacheEntry {
                        value: json,
                        expires_at: Instant::now() + Duration::from_secs(ttl_secs),
                    },
                );
                Ok(())
            }
        }
    }

    /// Remove a key everywhere it may be cached.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.local.remove(key);
        if let Some(shared) = &self.shared {
            shared.del(key).await?;
        }
        Ok(())
    }

    /// Remove all locally-expired entries.  Call this periodically from a
    /// background task (e.g. every 60 s) to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        before - self.local.len()
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn get_local(&self, key: &str) -> Option<String> {
        let entry = self.local.get(key)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.value.clone());
        }
        // expired; drop the ref before removing
        drop(entry);
        self.local.remove(key);
        None
    }
}

/// Keys embed secrets; only the namespace is safe to log.
fn key_prefix(key: &str) -> &str {
    key.split(':').next().unwrap_or("")
}

/// Process-local stand-in for Redis, shared between caches in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MapTier(DashMap<String, String>);

#[cfg(test)]
#[async_trait]
impl SharedTier for MapTier {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.get(key).map(|v| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: String, _ttl_secs: u64) -> anyhow::Result<()> {
        self.0.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.0.remove(key);
        Ok(())
    }
}
