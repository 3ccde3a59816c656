//! Cache port with Redis and in-process implementations.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::{Client, aio::ConnectionManager};
use uuid::Uuid;

/// Every key the service writes. Rendering is fixed so other instances (and
/// operators) can find the same entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    PlanEntitlements(Uuid),
    UserActivePlan(Uuid),
    Entitlement(Uuid),
    JobLock(&'static str),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::PlanEntitlements(plan_id) => write!(f, "plan:{}:entitlements", plan_id),
            CacheKey::UserActivePlan(user_id) => write!(f, "user:{}:activeplan", user_id),
            CacheKey::Entitlement(entitlement_id) => write!(f, "entitlement:{}", entitlement_id),
            CacheKey::JobLock(job) => write!(f, "lock:job:{}", job),
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, anyhow::Error>;
    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<(), anyhow::Error>;
    async fn delete(&self, key: &CacheKey) -> Result<(), anyhow::Error>;
    /// Take `key` for `ttl` if nobody holds it. `token` identifies the holder.
    async fn try_lock(
        &self,
        key: &CacheKey,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error>;
    /// Release `key` only if `token` still holds it.
    async fn release_lock(&self, key: &CacheKey, token: &str) -> Result<bool, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");
        Ok(Self { manager })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))
    }

    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key.to_string())
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete cache key: {}", e))
    }

    async fn try_lock(
        &self,
        key: &CacheKey,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key.to_string())
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &CacheKey, token: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(key.to_string())
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to release lock: {}", e))?;
        Ok(deleted == 1)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Process-local cache with per-entry expiry. Suitable for a single instance
/// and for tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .get(&key.to_string())
            .is_some_and(|entry| entry.1 > Instant::now())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, anyhow::Error> {
        let key = key.to_string();
        let hit = self.entries.get(&key).and_then(|entry| {
            let (value, expires_at) = entry.value();
            (*expires_at > Instant::now()).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries
                .remove_if(&key, |_, (_, expires_at)| *expires_at <= Instant::now());
        }
        Ok(hit)
    }

    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), anyhow::Error> {
        self.entries.remove(&key.to_string());
        Ok(())
    }

    async fn try_lock(
        &self,
        key: &CacheKey,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = Instant::now();
        let acquired = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().1 <= now {
                    entry.insert((token.to_string(), now + ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert((token.to_string(), now + ttl));
                true
            }
        };
        Ok(acquired)
    }

    async fn release_lock(&self, key: &CacheKey, token: &str) -> Result<bool, anyhow::Error> {
        Ok(self
            .entries
            .remove_if(&key.to_string(), |_, (holder, _)| holder == token)
            .is_some())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
