//! Progress store bridge
//!
//! The external worker writes counters into `task_progress:<job_id>` out of
//! band; pollers read them through [`ProgressStore::report`] and the
//! supervisor snapshots them exactly once when it finalizes a job.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProgressConfig;
use crate::job::{FinalCounters, Job, JobStatus};
use crate::store::{progress_key, SharedStore, StoreResult};

pub const INPUT_CHARS: &str = "input_chars";
pub const OUTPUT_CHARS: &str = "output_chars";
pub const CURRENT_ROUND: &str = "current_round";
pub const TOTAL_ROUNDS: &str = "total_rounds";
pub const COMPLETION_PERCENT: &str = "completion_percent";

/// Parsed contents of a progress hash
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub input_chars: u64,
    pub output_chars: u64,
    pub current_round: Option<f64>,
    pub total_rounds: Option<f64>,
    pub completion_percent: Option<f64>,
    /// Fields the worker wrote that are not interpreted here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressSnapshot {
    /// Parse a raw hash. Values are decoded as JSON when possible and kept
    /// as strings otherwise; a malformed counter reads as zero.
    pub fn from_hash(hash: HashMap<String, String>) -> Self {
        let mut snapshot = Self::default();
        for (field, raw) in hash {
            let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            match field.as_str() {
                INPUT_CHARS => snapshot.input_chars = as_counter(&field, &value),
                OUTPUT_CHARS => snapshot.output_chars = as_counter(&field, &value),
                CURRENT_ROUND => snapshot.current_round = value.as_f64(),
                TOTAL_ROUNDS => snapshot.total_rounds = value.as_f64(),
                COMPLETION_PERCENT => snapshot.completion_percent = value.as_f64(),
                _ => {
                    snapshot.extra.insert(field, value);
                }
            }
        }
        snapshot
    }

    /// `completion_percent` when present, else derived from rounds; capped at 100
    pub fn percent(&self) -> f64 {
        let percent = match (self.completion_percent, self.current_round, self.total_rounds) {
            (Some(percent), _, _) => percent,
            (None, Some(current), Some(total)) if total > 0.0 => current / total * 100.0,
            _ => 0.0,
        };
        percent.clamp(0.0, 100.0)
    }

    pub fn counters(&self) -> FinalCounters {
        FinalCounters {
            input_chars: self.input_chars,
            output_chars: self.output_chars,
        }
    }
}

fn as_counter(field: &str, value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        other => {
            debug!(field, value = %other, "Ignoring non-numeric progress counter");
            0
        }
    }
}

/// Where a progress report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Store,
    Memory,
}

/// Answer to a progress poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub job_id: String,
    pub progress_percent: f64,
    pub source: ReportSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time_secs: Option<f64>,
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
}

impl ProgressReport {
    pub fn from_snapshot(job_id: &str, mut snapshot: ProgressSnapshot) -> Self {
        let status = match snapshot.extra.remove("status") {
            Some(Value::String(status)) => Some(status),
            Some(other) => Some(other.to_string()),
            None => None,
        };
        for reserved in ["job_id", "progress_percent", "source", "run_time_secs"] {
            snapshot.extra.remove(reserved);
        }
        Self {
            job_id: job_id.to_string(),
            progress_percent: snapshot.percent(),
            source: ReportSource::Store,
            status,
            run_time_secs: None,
            snapshot,
        }
    }

    /// Report for a job whose hash is gone or was never written
    pub fn from_job(job: &Job) -> Self {
        let status = match job.termination() {
            None => "running",
            Some(t) if t.status == JobStatus::Stopped => "stopped",
            Some(t) if t.status == JobStatus::Finished && t.return_code == 0 => "completed",
            Some(_) => "failed",
        };
        let snapshot = ProgressSnapshot {
            current_round: Some(0.0),
            total_rounds: Some(f64::from(job.params().data_rounds)),
            ..job
                .termination()
                .and_then(|t| t.counters)
                .map(|c| ProgressSnapshot {
                    input_chars: c.input_chars,
                    output_chars: c.output_chars,
                    ..ProgressSnapshot::default()
                })
                .unwrap_or_default()
        };

        Self {
            job_id: job.id().to_string(),
            progress_percent: 0.0,
            source: ReportSource::Memory,
            status: Some(status.to_string()),
            run_time_secs: Some(job.run_time().as_secs_f64()),
            snapshot,
        }
    }
}

/// Read/write access to progress hashes
#[derive(Clone)]
pub struct ProgressStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn SharedStore>, config: &ProgressConfig) -> Self {
        Self {
            store,
            ttl: config.ttl,
        }
    }

    /// Zero the character counters and start the hash's TTL
    pub async fn init(&self, job_id: &str) -> StoreResult<()> {
        let fields = [
            (INPUT_CHARS.to_string(), "0".to_string()),
            (OUTPUT_CHARS.to_string(), "0".to_string()),
        ];
        self.store
            .hash_set(&progress_key(job_id), &fields, Some(self.ttl))
            .await
    }

    /// Merge fields into the hash, the way the worker does
    pub async fn update(&self, job_id: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.store
            .hash_set(&progress_key(job_id), fields, Some(self.ttl))
            .await
    }

    /// Current hash contents; `None` when the hash does not exist
    pub async fn snapshot(&self, job_id: &str) -> StoreResult<Option<ProgressSnapshot>> {
        let hash = self.store.hash_get_all(&progress_key(job_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProgressSnapshot::from_hash(hash)))
    }

    /// Counters to freeze into a job's terminal record, zero when absent
    pub async fn final_counters(&self, job_id: &str) -> StoreResult<FinalCounters> {
        Ok(self
            .snapshot(job_id)
            .await?
            .map(|s| s.counters())
            .unwrap_or_default())
    }

    /// Poll answer from the hash, or `None` when it is missing
    pub async fn report(&self, job_id: &str) -> StoreResult<Option<ProgressReport>> {
        Ok(self
            .snapshot(job_id)
            .await?
            .map(|snapshot| ProgressReport::from_snapshot(job_id, snapshot)))
    }

    pub async fn clear(&self, job_id: &str) -> StoreResult<()> {
        self.store.delete(&progress_key(job_id)).await
    }
}
