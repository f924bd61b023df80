//! Admission controller
//!
//! A cross-process counting semaphore over a shared store counter
//! (`model_limit:<model>`). Each attempt is one atomic
//! increment/compare/rollback round trip; rejected attempts back off
//! exponentially up to `max_wait`.
//!
//! When the store cannot be reached the controller admits the job anyway
//! (see [`Admission::Degraded`]). This favours availability over strict
//! fairness: during an outage the per-model limit is not enforced. Set
//! `admission.degrade_on_unavailable = false` to fail such jobs instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;
use crate::error::ErrorCode;
use crate::store::{SharedStore, StoreError};

/// Admission failures
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Timed out after {waited:?} waiting for a slot on {limit_key}")]
    Timeout { limit_key: String, waited: Duration },

    #[error("Admission store unavailable for {limit_key}: {source}")]
    BackendUnavailable {
        limit_key: String,
        #[source]
        source: StoreError,
    },

    #[error("Admission wait on {limit_key} was cancelled")]
    Cancelled { limit_key: String },

    #[error("Invalid concurrency limit {limit} for {limit_key}")]
    InvalidLimit { limit_key: String, limit: u32 },

    #[error("Admission store error: {0}")]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => ErrorCode::ADMISSION_TIMEOUT,
            Self::BackendUnavailable { .. } => ErrorCode::ADMISSION_BACKEND_UNAVAILABLE,
            Self::Cancelled { .. } => ErrorCode::ADMISSION_CANCELLED,
            Self::InvalidLimit { .. } => ErrorCode::VALIDATION_OUT_OF_RANGE,
            Self::Store(err) => err.code(),
        }
    }
}

/// Exponential backoff between rejected attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Interval following `current`: doubled, capped at `max`
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    /// Successive intervals starting at `initial`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial), move |d| Some(self.next(*d)))
    }
}

/// Outcome of a successful `acquire`
#[derive(Debug)]
pub enum Admission {
    /// A slot is held until the ticket is released
    Granted(AdmissionTicket),
    /// Admitted without a slot because the store was unreachable
    Degraded { limit_key: String, reason: String },
}

impl Admission {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Give the slot back, if one is held
    pub async fn release(&self) {
        if let Self::Granted(ticket) = self {
            ticket.release().await;
        }
    }
}

/// One held slot of a limit key
///
/// Released explicitly with [`release`](Self::release); dropping an
/// unreleased ticket schedules a best-effort release on the current runtime.
pub struct AdmissionTicket {
    store: Arc<dyn SharedStore>,
    limit_key: String,
    ttl: Duration,
    released: AtomicBool,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("limit_key", &self.limit_key)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl AdmissionTicket {
    pub fn limit_key(&self) -> &str {
        &self.limit_key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Decrement the counter once; later calls do nothing
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        release_slot(self.store.as_ref(), &self.limit_key, self.ttl).await;
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let limit_key = std::mem::take(&mut self.limit_key);
                let ttl = self.ttl;
                handle.spawn(async move {
                    release_slot(store.as_ref(), &limit_key, ttl).await;
                });
            }
            Err(_) => warn!(
                limit_key = %self.limit_key,
                "Ticket dropped outside a runtime; slot left to expire with its TTL"
            ),
        }
    }
}

async fn release_slot(store: &dyn SharedStore, limit_key: &str, ttl: Duration) {
    match store.release(limit_key, ttl).await {
        Ok(0) => debug!(limit_key, "Released last slot, counter removed"),
        Ok(remaining) => debug!(limit_key, remaining, "Released slot"),
        Err(e) => warn!(limit_key, error = %e, "Failed to release slot; it expires with its TTL"),
    }
}

/// Cross-process counting semaphore
pub struct AdmissionController {
    store: Arc<dyn SharedStore>,
    backoff: BackoffPolicy,
    ticket_ttl: Duration,
    degrade_on_unavailable: bool,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn SharedStore>, config: &AdmissionConfig) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::new(config.initial_backoff, config.max_backoff),
            ticket_ttl: config.ticket_ttl,
            degrade_on_unavailable: config.degrade_on_unavailable,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Wait for a slot on `limit_key`, bounded by `max_wait` and `cancel`
    pub async fn acquire(
        &self,
        limit_key: &str,
        max_concurrency: u32,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Admission, AdmissionError> {
        if max_concurrency == 0 {
            return Err(AdmissionError::InvalidLimit {
                limit_key: limit_key.to_string(),
                limit: max_concurrency,
            });
        }

        let started = Instant::now();
        let deadline = started + max_wait;
        let mut delay = self.backoff.initial;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AdmissionError::Cancelled {
                    limit_key: limit_key.to_string(),
                });
            }

            attempts += 1;
            match self
                .store
                .try_acquire(limit_key, u64::from(max_concurrency), self.ticket_ttl)
                .await
            {
                Ok(reply) if reply.granted => {
                    info!(
                        limit_key,
                        current = reply.current,
                        max_concurrency,
                        attempts,
                        "Admission granted"
                    );
                    return Ok(Admission::Granted(AdmissionTicket {
                        store: self.store.clone(),
                        limit_key: limit_key.to_string(),
                        ttl: self.ticket_ttl,
                        released: AtomicBool::new(false),
                    }));
                }
                Ok(reply) => {
                    debug!(
                        limit_key,
                        current = reply.current,
                        max_concurrency,
                        attempts,
                        "All slots taken"
                    );
                }
                Err(e) if e.is_unavailable() => return self.on_unavailable(limit_key, e),
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AdmissionError::Timeout {
                    limit_key: limit_key.to_string(),
                    waited: now - started,
                });
            }

            let sleep_for = delay.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AdmissionError::Cancelled {
                        limit_key: limit_key.to_string(),
                    });
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
            delay = self.backoff.next(delay);
        }
    }

    fn on_unavailable(&self, limit_key: &str, source: StoreError) -> Result<Admission, AdmissionError> {
        if !self.degrade_on_unavailable {
            return Err(AdmissionError::BackendUnavailable {
                limit_key: limit_key.to_string(),
                source,
            });
        }

        warn!(
            limit_key,
            error = %source,
            "Admission store unreachable, admitting without a slot"
        );
        Ok(Admission::Degraded {
            limit_key: limit_key.to_string(),
            reason: source.to_string(),
        })
    }

    /// Give back one slot of `limit_key`; the counter never goes below zero
    pub async fn release(&self, limit_key: &str) -> Result<u64, AdmissionError> {
        Ok(self.store.release(limit_key, self.ticket_ttl).await?)
    }

    /// Outstanding slots of `limit_key`, 0 when the key is absent
    pub async fn current(&self, limit_key: &str) -> Result<u64, AdmissionError> {
        Ok(self.store.counter(limit_key).await?)
    }
}
