//! In-memory shared store
//!
//! Coordinates only the jobs of the current process. Used when no Redis URL
//! is configured and as the store double in tests; `set_available(false)`
//! simulates an outage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::store::error::{StoreError, StoreResult};
use crate::store::{AcquireReply, SharedStore};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory shared store
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated reachability; while unavailable every call fails
    /// with [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Remaining TTL of a key, if it exists and has one
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Whether a key currently exists
    pub async fn contains_key(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("memory store marked unavailable"))
        } else {
            Ok(())
        }
    }

    /// Drop the entry if it has expired, then return it
    fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn counter_value(entry: Option<&mut Entry>, key: &str) -> StoreResult<u64> {
        match entry.map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Counter(value)) => Ok(*value),
            Some(Value::Hash(_)) => Err(StoreError::command(format!(
                "WRONGTYPE key {key} holds a hash, not a counter"
            ))),
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn try_acquire(&self, key: &str, limit: u64, ttl: Duration) -> StoreResult<AcquireReply> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        let current = Self::counter_value(Self::live_entry(&mut entries, key), key)?;
        let incremented = current + 1;
        if incremented > limit {
            return Ok(AcquireReply {
                granted: false,
                current,
            });
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(incremented),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(AcquireReply {
            granted: true,
            current: incremented,
        })
    }

    async fn release(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        let current = Self::counter_value(Self::live_entry(&mut entries, key), key)?;
        if current <= 1 {
            entries.remove(key);
            return Ok(0);
        }

        let remaining = current - 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(remaining),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(remaining)
    }

    async fn counter(&self, key: &str) -> StoreResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::counter_value(Self::live_entry(&mut entries, key), key)
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        match Self::live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Hash(hash),
                expires_at: existing,
            }) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                if expires_at.is_some() {
                    *existing = expires_at;
                }
            }
            Some(_) => {
                return Err(StoreError::command(format!(
                    "WRONGTYPE key {key} holds a counter, not a hash"
                )))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields.iter().cloned().collect()),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match Self::live_entry(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(Value::Counter(_)) => Err(StoreError::command(format!(
                "WRONGTYPE key {key} holds a counter, not a hash"
            ))),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
