//! Persistence collaborator
//!
//! The coordinator reports job records through [`JobSink`] and never reads
//! them back. Implementations must treat `job_finished` as an upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::job::{Job, JobStatus};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Persistence backend error: {0}")]
    Backend(String),
}

/// Persisted view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owner_id: String,
    pub name: String,
    pub file_id: String,
    pub model: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub input_chars: Option<u64>,
    pub output_chars: Option<u64>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        let params = job.params();
        let termination = job.termination();
        let counters = termination.and_then(|t| t.counters);
        Self {
            job_id: job.id().to_string(),
            owner_id: params.owner_id.clone(),
            name: params.name.clone(),
            file_id: params.file_id.clone(),
            model: params.model.model.clone(),
            status: job.status(),
            started_at: job.started_at(),
            ended_at: termination.map(|t| t.ended_at),
            return_code: termination.map(|t| t.return_code),
            input_chars: counters.map(|c| c.input_chars),
            output_chars: counters.map(|c| c.output_chars),
        }
    }
}

#[async_trait]
pub trait JobSink: Send + Sync {
    async fn job_started(&self, record: &JobRecord) -> Result<(), SinkError>;

    async fn job_finished(&self, record: &JobRecord) -> Result<(), SinkError>;

    async fn job_deleted(&self, job_id: &str) -> Result<(), SinkError>;
}

/// Discards every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJobSink;

#[async_trait]
impl JobSink for NoopJobSink {
    async fn job_started(&self, _record: &JobRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn job_finished(&self, _record: &JobRecord) -> Result<(), SinkError> {
        Ok(())
    }

    async fn job_deleted(&self, _job_id: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps records in memory; counts terminal writes per job
#[derive(Debug, Clone, Default)]
pub struct MemoryJobSink {
    records: Arc<Mutex<HashMap<String, JobRecord>>>,
    finished_writes: Arc<Mutex<HashMap<String, usize>>>,
}

impl MemoryJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.records.lock().await.get(job_id).cloned()
    }

    pub async fn finished_writes(&self, job_id: &str) -> usize {
        self.finished_writes
            .lock()
            .await
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobSink for MemoryJobSink {
    async fn job_started(&self, record: &JobRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .await
            .insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn job_finished(&self, record: &JobRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .await
            .insert(record.job_id.clone(), record.clone());
        *self
            .finished_writes
            .lock()
            .await
            .entry(record.job_id.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn job_deleted(&self, job_id: &str) -> Result<(), SinkError> {
        self.records.lock().await.remove(job_id);
        Ok(())
    }
}
