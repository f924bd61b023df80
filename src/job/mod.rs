//! Job data model
//!
//! A [`Job`] is created once at submission and owned by the
//! [`TaskRegistry`](crate::registry::TaskRegistry). Its terminal state is a
//! claim-once cell: whichever of explicit stop or natural completion sets it
//! first wins, and the loser's attempt leaves it untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Job identifier, caller supplied or generated by the registry
pub type JobId = String;

/// Externally visible job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Finished,
    Error,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the job's supervisor task currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Waiting for an admission slot
    Pending,
    /// Worker process launched
    Running,
    /// Final record persisted and `finished` published
    Done,
}

impl JobPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            _ => Self::Done,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Done => 2,
        }
    }
}

/// How the job got past admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Holds a slot of the shared counter
    Limited,
    /// Admitted without a slot because the store was unreachable
    Degraded,
}

/// Credentials and sampling settings of a configured model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request timeout handed to the worker, in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for ModelCredentials {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_request_timeout(),
        }
    }
}

/// The model-serving capacity a job targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Model identifier, also names the admission counter
    pub model: String,
    /// Model path or served name handed to the worker; defaults to `model`
    #[serde(default)]
    pub path: Option<String>,
    /// Endpoint URLs handed to the worker
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub credentials: Option<ModelCredentials>,
    #[serde(default)]
    pub is_vllm: bool,
    /// Overrides the configured default slot count for this model
    #[serde(default)]
    pub max_concurrency: Option<u32>,
}

impl ModelTarget {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            path: None,
            services: Vec::new(),
            credentials: None,
            is_vllm: false,
            max_concurrency: None,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, credentials: ModelCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }
}

/// Everything a caller supplies to submit a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Explicit id; generated from `name` when absent
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub name: String,
    pub owner_id: String,
    pub file_id: String,
    pub model: ModelTarget,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_variants_per_sample")]
    pub variants_per_sample: u32,
    #[serde(default = "default_data_rounds")]
    pub data_rounds: u32,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    #[serde(default)]
    pub special_prompt: Option<String>,
    #[serde(default)]
    pub directions: Option<String>,
}

impl JobParams {
    pub fn new(owner_id: impl Into<String>, file_id: impl Into<String>, model: ModelTarget) -> Self {
        Self {
            job_id: None,
            name: String::new(),
            owner_id: owner_id.into(),
            file_id: file_id.into(),
            model,
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            min_score: default_min_score(),
            task_type: default_task_type(),
            variants_per_sample: default_variants_per_sample(),
            data_rounds: default_data_rounds(),
            retry_times: default_retry_times(),
            special_prompt: None,
            directions: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    16
}

fn default_max_concurrent() -> u32 {
    16
}

fn default_min_score() -> u32 {
    10
}

fn default_task_type() -> String {
    "general".to_string()
}

fn default_variants_per_sample() -> u32 {
    3
}

fn default_data_rounds() -> u32 {
    10
}

fn default_retry_times() -> u32 {
    3
}

/// Counters captured from the progress store at finalize time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalCounters {
    pub input_chars: u64,
    pub output_chars: u64,
}

/// Terminal record of a job, written exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    pub status: JobStatus,
    pub ended_at: DateTime<Utc>,
    pub return_code: i32,
    pub counters: Option<FinalCounters>,
}

impl Termination {
    pub fn new(status: JobStatus, return_code: i32, counters: Option<FinalCounters>) -> Self {
        Self {
            status,
            ended_at: Utc::now(),
            return_code,
            counters,
        }
    }
}

/// A tracked job
#[derive(Debug)]
pub struct Job {
    id: JobId,
    params: JobParams,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    phase: AtomicU8,
    admission: OnceLock<AdmissionMode>,
    termination: OnceLock<Termination>,
}

impl Job {
    pub fn new(id: JobId, params: JobParams) -> Self {
        Self {
            id,
            params,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            phase: AtomicU8::new(JobPhase::Pending.as_u8()),
            admission: OnceLock::new(),
            termination: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.params.owner_id
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Capability to request early termination of the worker
    pub fn cancel_handle(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn status(&self) -> JobStatus {
        self.termination
            .get()
            .map(|t| t.status)
            .unwrap_or(JobStatus::Running)
    }

    pub fn is_running(&self) -> bool {
        self.termination.get().is_none()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.get()
    }

    /// Claim the terminal state. Returns `false`, leaving the existing record
    /// untouched, when another path already claimed it.
    pub fn try_finalize(&self, termination: Termination) -> bool {
        self.termination.set(termination).is_ok()
    }

    pub fn phase(&self) -> JobPhase {
        JobPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: JobPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub fn admission_mode(&self) -> Option<AdmissionMode> {
        self.admission.get().copied()
    }

    pub fn record_admission(&self, mode: AdmissionMode) {
        let _ = self.admission.set(mode);
    }

    /// Elapsed time between start and end, or start and now while running
    pub fn run_time(&self) -> Duration {
        let end = self
            .termination
            .get()
            .map(|t| t.ended_at)
            .unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let termination = self.termination.get();
        JobSnapshot {
            job_id: self.id.clone(),
            owner_id: self.params.owner_id.clone(),
            name: self.params.name.clone(),
            model: self.params.model.model.clone(),
            status: self.status(),
            phase: self.phase(),
            admission: self.admission_mode(),
            started_at: self.started_at,
            ended_at: termination.map(|t| t.ended_at),
            return_code: termination.map(|t| t.return_code),
            final_counters: termination.and_then(|t| t.counters),
            run_time_secs: self.run_time().as_secs(),
        }
    }
}

/// Read-only view of a job for listing and status endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub owner_id: String,
    pub name: String,
    pub model: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub admission: Option<AdmissionMode>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub final_counters: Option<FinalCounters>,
    pub run_time_secs: u64,
}
