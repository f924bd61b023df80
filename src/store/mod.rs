//! Shared key-value store used for cross-process coordination
//!
//! Two structures live here: the admission counters (`model_limit:<model>`)
//! and the per-job progress hashes (`task_progress:<job_id>`). Every
//! operation on them is a single atomic round trip; no client-side lock is
//! ever held across calls.

pub mod backends;
pub mod error;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::StoreConfig;

pub use backends::MemoryStore;
#[cfg(feature = "redis")]
pub use backends::RedisStore;
pub use error::{StoreError, StoreResult};

/// Prefix of admission counter keys
pub const LIMIT_KEY_PREFIX: &str = "model_limit:";

/// Prefix of progress hash keys
pub const PROGRESS_KEY_PREFIX: &str = "task_progress:";

/// Admission counter key for a model identifier
pub fn limit_key(model: &str) -> String {
    format!("{LIMIT_KEY_PREFIX}{model}")
}

/// Progress hash key for a job
pub fn progress_key(job_id: &str) -> String {
    format!("{PROGRESS_KEY_PREFIX}{job_id}")
}

/// Reply of an atomic acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireReply {
    /// Whether the increment was kept
    pub granted: bool,
    /// Counter value after the operation (rolled back value when not granted)
    pub current: u64,
}

/// Atomic operations the coordinator needs from the shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Increment `key`, compare against `limit` and roll the increment back
    /// when it overshoots, all in one atomic step. A kept increment refreshes
    /// the key's TTL.
    async fn try_acquire(&self, key: &str, limit: u64, ttl: Duration) -> StoreResult<AcquireReply>;

    /// Decrement `key` floored at zero, deleting it once it reaches zero.
    /// Returns the remaining count.
    async fn release(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Current counter value, 0 when the key is absent
    async fn counter(&self, key: &str) -> StoreResult<u64>;

    /// Write several hash fields at once, optionally (re)setting the TTL
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Read every field of a hash; empty when the key is absent
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Remove a key
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Liveness check (PING for Redis)
    async fn health_check(&self) -> StoreResult<()>;

    /// Backend name for diagnostics
    fn backend_name(&self) -> &'static str;
}

/// Factory for creating shared store instances
pub struct StoreFactory;

impl StoreFactory {
    /// Create the store described by `config`
    ///
    /// A configured Redis URL selects the Redis backend; otherwise counters
    /// and progress live in process memory, which only coordinates jobs of
    /// this one process.
    pub async fn from_config(config: &StoreConfig) -> StoreResult<Arc<dyn SharedStore>> {
        match &config.redis_url {
            #[cfg(feature = "redis")]
            Some(_) => {
                let store = RedisStore::new(config).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => Err(StoreError::configuration(
                "Redis backend not enabled. Enable with --features redis",
            )),
            None => {
                info!("No redis_url configured, using in-process shared store");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}
