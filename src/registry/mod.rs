//! Task registry: concurrency-safe map from job id to job state

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::job::{Job, JobId, JobParams, JobPhase};

/// Longest id prefix taken from a job name, in characters
pub const MAX_ID_BASE_CHARS: usize = 50;

/// Registry of live and terminal jobs
///
/// Entries are `Arc<Job>`; the map lock is only held for the lookup itself,
/// and each job synchronizes its own state.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    jobs: Arc<RwLock<HashMap<JobId, Arc<Job>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new job
    ///
    /// An explicit `job_id` must be unused. Without one, the id is the job
    /// name cut to [`MAX_ID_BASE_CHARS`] characters, suffixed `_1`, `_2`, ...
    /// until free.
    pub fn create(&self, params: JobParams) -> CoordinatorResult<Arc<Job>> {
        let mut jobs = self.write();

        let id = match &params.job_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoordinatorError::InvalidRequest(
                    "job_id must not be blank".to_string(),
                ))
            }
            Some(id) if jobs.contains_key(id) => {
                return Err(CoordinatorError::JobAlreadyExists(id.clone()))
            }
            Some(id) => id.clone(),
            None => unique_id(&params.name, |candidate| jobs.contains_key(candidate)),
        };

        let job = Arc::new(Job::new(id.clone(), params));
        jobs.insert(id.clone(), job.clone());
        debug!(job_id = %id, "Registered job");
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> CoordinatorResult<Arc<Job>> {
        self.read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    /// All jobs, oldest first
    pub fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<_> = self.read().values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.started_at()
                .cmp(&b.started_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        jobs
    }

    /// Remove a job whose supervisor task has fully finished
    ///
    /// A claimed terminal status is not enough: until the task has persisted
    /// and announced the final record the job still counts as running.
    pub fn remove(&self, job_id: &str) -> CoordinatorResult<Arc<Job>> {
        let mut jobs = self.write();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;

        if job.is_running() || job.phase() != JobPhase::Done {
            return Err(CoordinatorError::JobStillRunning(job_id.to_string()));
        }

        let job = jobs
            .remove(job_id)
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;
        debug!(job_id, "Removed job");
        Ok(job)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn unique_id(name: &str, taken: impl Fn(&str) -> bool) -> JobId {
    let base: String = name.trim().chars().take(MAX_ID_BASE_CHARS).collect();
    if base.is_empty() {
        return Uuid::new_v4().to_string();
    }
    if !taken(&base) {
        return base;
    }
    (1u64..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, ModelTarget, Termination};

    fn params(name: &str) -> JobParams {
        JobParams::new("owner", "file", ModelTarget::new("m")).with_name(name)
    }

    #[test]
    fn test_generated_ids_are_suffixed() {
        let registry = TaskRegistry::new();
        let a = registry.create(params("report.jsonl")).unwrap();
        let b = registry.create(params("report.jsonl")).unwrap();
        let c = registry.create(params("report.jsonl")).unwrap();

        assert_eq!(a.id(), "report.jsonl");
        assert_eq!(b.id(), "report.jsonl_1");
        assert_eq!(c.id(), "report.jsonl_2");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_long_names_cut_on_char_boundary() {
        let registry = TaskRegistry::new();
        let name = "数据".repeat(40);
        let job = registry.create(params(&name)).unwrap();
        assert_eq!(job.id().chars().count(), MAX_ID_BASE_CHARS);
    }

    #[test]
    fn test_empty_name_gets_uuid() {
        let registry = TaskRegistry::new();
        let job = registry.create(params("  ")).unwrap();
        assert!(Uuid::parse_str(job.id()).is_ok());
    }

    #[test]
    fn test_explicit_id_must_be_unique() {
        let registry = TaskRegistry::new();
        registry.create(params("x").with_job_id("job-1")).unwrap();
        let err = registry.create(params("x").with_job_id("job-1")).unwrap_err();
        assert!(matches!(err, CoordinatorError::JobAlreadyExists(_)));
    }

    #[test]
    fn test_remove_requires_terminal_status() {
        let registry = TaskRegistry::new();
        let job = registry.create(params("x")).unwrap();

        let err = registry.remove(job.id()).unwrap_err();
        assert!(matches!(err, CoordinatorError::JobStillRunning(_)));

        job.try_finalize(Termination::new(JobStatus::Finished, 0, None));
        let err = registry.remove(job.id()).unwrap_err();
        assert!(matches!(err, CoordinatorError::JobStillRunning(_)));

        job.set_phase(JobPhase::Done);
        registry.remove(job.id()).unwrap();
        assert!(registry.get(job.id()).unwrap_err().is_not_found());
        assert!(registry.remove(job.id()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_concurrent_creates_get_distinct_ids() {
        let registry = TaskRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.create(params("same")).unwrap())
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().id().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(registry.list().len(), 16);
    }
}
