//! Redis shared store backend

use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::store::error::{StoreError, StoreResult};
use crate::store::{AcquireReply, SharedStore};

/// Increment, compare, conditionally roll back. Returns `{granted, current}`.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local limit = tonumber(ARGV[1])
if current > limit then
    local rolled_back = redis.call('DECR', KEYS[1])
    if rolled_back <= 0 then
        redis.call('DEL', KEYS[1])
        rolled_back = 0
    end
    return {0, rolled_back}
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return {1, current}
"#;

/// Decrement floored at zero; delete the key once it reaches zero.
const RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
    redis.call('DEL', KEYS[1])
    return 0
end
local remaining = redis.call('DECR', KEYS[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return remaining
"#;

/// Redis shared store backend
pub struct RedisStore {
    pool: Arc<Pool>,
    key_prefix: String,
    acquire_script: Script,
    release_script: Script,
}

impl RedisStore {
    /// Create new Redis store
    ///
    /// Connections are opened lazily. An unreachable server is logged here
    /// and surfaces later as `Unavailable` errors, which admission treats as
    /// an outage.
    pub async fn new(config: &StoreConfig) -> StoreResult<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| StoreError::configuration("redis_url is not set"))?;
        info!("Initializing Redis shared store");

        let mut pool_config = Config::from_url(url);
        let mut pool_settings = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_settings.timeouts.wait = Some(config.connect_timeout);
        pool_settings.timeouts.create = Some(config.connect_timeout);
        pool_settings.timeouts.recycle = Some(config.connect_timeout);
        pool_config.pool = Some(pool_settings);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::configuration(format!("Failed to create Redis pool: {}", e)))?;

        let store = Self {
            pool: Arc::new(pool),
            key_prefix: config.key_prefix.clone(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        };

        if let Err(e) = store.health_check().await {
            warn!(error = %e, "Redis is not reachable yet, admission degrades until it is");
        }
        Ok(store)
    }

    /// Generate key with prefix
    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> StoreResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::unavailable(format!("Failed to get Redis connection: {}", e)))
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn try_acquire(&self, key: &str, limit: u64, ttl: Duration) -> StoreResult<AcquireReply> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let (granted, current): (i64, i64) = self
            .acquire_script
            .key(&key)
            .arg(limit)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;

        if current < 0 {
            return Err(StoreError::script(format!(
                "acquire script returned negative count {} for {}",
                current, key
            )));
        }

        debug!(key = %key, granted = granted == 1, current, limit, "acquire attempt");
        Ok(AcquireReply {
            granted: granted == 1,
            current: current as u64,
        })
    }

    async fn release(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let remaining: i64 = self
            .release_script
            .key(&key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, remaining, "released slot");
        Ok(remaining.max(0) as u64)
    }

    async fn counter(&self, key: &str) -> StoreResult<u64> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let value: Option<i64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        if fields.is_empty() && ttl.is_none() {
            return Ok(());
        }

        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        if !fields.is_empty() {
            pipe.hset_multiple(&key, fields).ignore();
        }
        if let Some(ttl) = ttl {
            pipe.expire(&key, ttl_secs(ttl)).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let hash: HashMap<String, String> = conn.hgetall(&key).await?;
        Ok(hash)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = self.make_key(key);
        let mut conn = self.connection().await?;

        let _: () = conn.del(&key).await?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::command(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
