//! Coordinator configuration
//!
//! Loaded from a TOML file (every field optional, defaults below), then
//! overridden from `TASKHUB_*` environment variables, then validated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub progress: ProgressConfig,
}

/// Shared store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `redis://host:port/db`; absent means the in-process store
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Prepended to every key, empty by default so keys match the
    /// `model_limit:` / `task_progress:` layout other services read
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
            key_prefix: String::new(),
        }
    }
}

/// Admission controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Overall bound on waiting for a slot
    #[serde(with = "humantime_serde", default = "default_max_wait")]
    pub max_wait: Duration,

    /// First backoff interval after a rejected attempt
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Backoff doubles up to this interval
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Liveness TTL of the counter key, refreshed on every grant
    #[serde(with = "humantime_serde", default = "default_ticket_ttl")]
    pub ticket_ttl: Duration,

    /// Slots per model when the job does not carry its own limit
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: u32,

    /// Admit without limit when the store is unreachable
    #[serde(default = "default_true")]
    pub degrade_on_unavailable: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_wait: default_max_wait(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            ticket_ttl: default_ticket_ttl(),
            default_max_concurrency: default_max_concurrency(),
            degrade_on_unavailable: true,
        }
    }
}

/// External worker launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Interpreter or binary to run
    #[serde(default = "default_worker_program")]
    pub program: String,

    /// First positional argument, usually the worker script
    #[serde(default = "default_worker_entrypoint")]
    pub entrypoint: Option<String>,

    /// Working directory of the worker
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment; `PYTHONUNBUFFERED=1` is always set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Model endpoints used when a job names none
    #[serde(default)]
    pub default_services: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            entrypoint: default_worker_entrypoint(),
            working_dir: None,
            env: HashMap::new(),
            default_services: Vec::new(),
        }
    }
}

/// Event broadcaster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Queue depth of each live subscriber
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Keep at most this many events per job; unbounded when absent
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
            history_limit: None,
        }
    }
}

/// Progress hash settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// TTL of `task_progress:<job_id>`
    #[serde(with = "humantime_serde", default = "default_progress_ttl")]
    pub ttl: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ttl: default_progress_ttl(),
        }
    }
}

// Default value functions for serde
fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_ticket_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_concurrency() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_worker_program() -> String {
    "python3".to_string()
}

fn default_worker_entrypoint() -> Option<String> {
    Some("main.py".to_string())
}

fn default_subscriber_capacity() -> usize {
    200
}

fn default_progress_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl CoordinatorConfig {
    /// Load from a TOML file, then apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.merge_env_vars(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_env_vars(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TASKHUB_*` overrides read through `lookup`
    pub fn merge_env_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TASKHUB_REDIS_URL") {
            self.store.redis_url = (!url.trim().is_empty()).then_some(url);
        }

        if let Some(wait) = lookup("TASKHUB_MAX_WAIT") {
            self.admission.max_wait = humantime_serde::re::humantime::parse_duration(&wait)
                .map_err(|e| ConfigError::invalid("TASKHUB_MAX_WAIT", e.to_string()))?;
        }

        if let Some(program) = lookup("TASKHUB_WORKER_PROGRAM") {
            self.worker.program = program;
        }

        if let Some(dir) = lookup("TASKHUB_WORKER_DIR") {
            self.worker.working_dir = Some(PathBuf::from(dir));
        }

        if let Some(services) = lookup("TASKHUB_DEFAULT_SERVICES") {
            self.worker.default_services = services
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", "must be at least 1"));
        }
        if self.admission.default_max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "admission.default_max_concurrency",
                "must be at least 1",
            ));
        }
        if self.admission.initial_backoff.is_zero() {
            return Err(ConfigError::invalid(
                "admission.initial_backoff",
                "must be greater than zero",
            ));
        }
        if self.admission.max_backoff < self.admission.initial_backoff {
            return Err(ConfigError::invalid(
                "admission.max_backoff",
                "must not be shorter than initial_backoff",
            ));
        }
        if self.events.subscriber_capacity == 0 {
            return Err(ConfigError::invalid(
                "events.subscriber_capacity",
                "must be at least 1",
            ));
        }
        if self.events.history_limit == Some(0) {
            return Err(ConfigError::invalid(
                "events.history_limit",
                "must be at least 1 when set",
            ));
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::invalid("worker.program", "must not be empty"));
        }
        Ok(())
    }
}
