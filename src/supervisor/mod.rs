//! Process supervisor and the coordinator facade
//!
//! Each submitted job gets one tokio task that waits for admission, launches
//! the worker, pumps its output into the broadcaster and finalizes the job.
//! A second, tiny task watches the first so that a panic turns into an
//! `error` terminal state for that job only.
//!
//! Finalization is claim-once: explicit stop and natural completion both
//! try to set the job's terminal record and only the first succeeds. The
//! supervisor task always ends by persisting and announcing whichever record
//! won, so every job emits exactly one `finished` event.

pub mod classify;
pub mod command;
pub mod process;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::admission::{Admission, AdmissionController, AdmissionError};
use crate::broadcast::{EventBroadcaster, Subscription};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::ProgressEvent;
use crate::job::{AdmissionMode, Job, JobParams, JobPhase, JobSnapshot, JobStatus, Termination};
use crate::progress::{ProgressReport, ProgressStore};
use crate::registry::TaskRegistry;
use crate::sink::{JobRecord, JobSink, NoopJobSink};
use crate::store::{limit_key, SharedStore, StoreFactory};

pub use classify::{classify_line, classify_stdout, OutputSource};
pub use command::{WorkerCommand, WorkerCommandBuilder};
pub use process::{
    LineStream, TokioWorkerLauncher, WorkerError, WorkerExit, WorkerLauncher, WorkerProcess,
};

/// Return code recorded for a stopped job
pub const STOPPED_RETURN_CODE: i32 = -1;

/// Return code recorded when the coordinator itself fails a job
pub const FAILED_RETURN_CODE: i32 = 1;

/// How long output readers may keep draining after the worker is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct CoordinatorInner {
    config: CoordinatorConfig,
    registry: TaskRegistry,
    broadcaster: EventBroadcaster,
    admission: AdmissionController,
    progress: ProgressStore,
    launcher: Arc<dyn WorkerLauncher>,
    sink: Arc<dyn JobSink>,
}

/// Task execution coordinator
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    store: Arc<dyn SharedStore>,
    launcher: Arc<dyn WorkerLauncher>,
    sink: Arc<dyn JobSink>,
}

impl CoordinatorBuilder {
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn JobSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Coordinator {
        let inner = CoordinatorInner {
            registry: TaskRegistry::new(),
            broadcaster: EventBroadcaster::new(&self.config.events),
            admission: AdmissionController::new(self.store.clone(), &self.config.admission),
            progress: ProgressStore::new(self.store, &self.config.progress),
            launcher: self.launcher,
            sink: self.sink,
            config: self.config,
        };
        Coordinator {
            inner: Arc::new(inner),
        }
    }
}

/// Handle returned by [`Coordinator::submit`]
pub struct SubmittedJob {
    job: Arc<Job>,
    admitted: oneshot::Receiver<Result<AdmissionMode, AdmissionError>>,
}

impl SubmittedJob {
    pub fn job_id(&self) -> &str {
        self.job.id()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.snapshot()
    }

    /// Resolve once the job got past admission, or with the reason it did not
    pub async fn admitted(self) -> CoordinatorResult<AdmissionMode> {
        match self.admitted.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoordinatorError::Internal(format!(
                "job {} ended before reporting admission",
                self.job.id()
            ))),
        }
    }
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig, store: Arc<dyn SharedStore>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store,
            launcher: Arc::new(TokioWorkerLauncher),
            sink: Arc::new(NoopJobSink),
        }
    }

    /// Coordinator over the store described by `config.store`
    pub async fn connect(config: CoordinatorConfig) -> CoordinatorResult<Self> {
        let store = StoreFactory::from_config(&config.store).await?;
        Ok(Self::builder(config, store).build())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.inner.progress
    }

    /// Register a job and start its supervisor task
    ///
    /// Validation failures and duplicate ids are returned here. Everything
    /// after registration, admission included, is reported on the job's
    /// event stream and status.
    pub async fn submit(&self, params: JobParams) -> CoordinatorResult<SubmittedJob> {
        let services = self.resolve_services(&params)?;
        let job = self.inner.registry.create(params)?;
        let job_id = job.id().to_string();
        self.inner.broadcaster.open(&job_id);

        if let Err(e) = self.inner.sink.job_started(&JobRecord::from_job(&job)).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist job start");
        }

        let (admitted_tx, admitted_rx) = oneshot::channel();
        let span = info_span!("job", job_id = %job_id, model = %job.params().model.model);
        let handle = tokio::spawn(
            run_job(self.inner.clone(), job.clone(), services, admitted_tx).instrument(span),
        );

        let inner = self.inner.clone();
        let watched = job.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                // A panic after `finish` completed has nothing left to announce
                if e.is_panic() && watched.phase() != JobPhase::Done {
                    error!(job_id = %watched.id(), "Job task panicked");
                    watched.try_finalize(Termination::new(
                        JobStatus::Error,
                        FAILED_RETURN_CODE,
                        None,
                    ));
                    inner.broadcaster.publish(
                        watched.id(),
                        ProgressEvent::error("internal error: job task panicked"),
                    );
                    finish(&inner, &watched).await;
                }
            }
        });

        info!(job_id = %job_id, "Job submitted");
        Ok(SubmittedJob {
            job,
            admitted: admitted_rx,
        })
    }

    fn resolve_services(&self, params: &JobParams) -> CoordinatorResult<Vec<String>> {
        if params.owner_id.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("owner_id is required".into()));
        }
        if params.file_id.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("file_id is required".into()));
        }
        if params.model.model.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest("model is required".into()));
        }
        if params.model.max_concurrency == Some(0) {
            return Err(CoordinatorError::InvalidRequest(
                "max_concurrency must be at least 1".into(),
            ));
        }

        let services = if params.model.services.is_empty() {
            self.inner.config.worker.default_services.clone()
        } else {
            params.model.services.clone()
        };
        if services.is_empty() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "no services configured for model {}",
                params.model.model
            )));
        }
        Ok(services)
    }

    /// Stop a running job on behalf of its owner
    ///
    /// Freezes the current progress counters into the job's terminal record,
    /// then kills the worker. Loses cleanly, with `JobNotRunning`, when the
    /// job finalized on its own first.
    pub async fn stop(&self, job_id: &str, owner_id: &str) -> CoordinatorResult<JobSnapshot> {
        let job = self.inner.registry.get(job_id)?;
        if job.owner_id() != owner_id {
            return Err(CoordinatorError::NotOwner {
                job_id: job_id.to_string(),
            });
        }
        if !job.is_running() {
            return Err(CoordinatorError::JobNotRunning {
                job_id: job_id.to_string(),
                status: job.status(),
            });
        }

        let counters = match self.inner.progress.final_counters(job_id).await {
            Ok(counters) => Some(counters),
            Err(e) => {
                warn!(job_id, error = %e, "Could not read progress counters at stop");
                None
            }
        };

        if !job.try_finalize(Termination::new(
            JobStatus::Stopped,
            STOPPED_RETURN_CODE,
            counters,
        )) {
            return Err(CoordinatorError::JobNotRunning {
                job_id: job_id.to_string(),
                status: job.status(),
            });
        }

        // Announce before cancelling so the notice precedes `finished`
        self.inner
            .broadcaster
            .publish(job_id, ProgressEvent::output("task stopped by user"));
        job.cancel_handle().cancel();
        if let Err(e) = self.inner.progress.clear(job_id).await {
            warn!(job_id, error = %e, "Failed to clear progress hash");
        }

        info!(job_id, "Job stopped");
        Ok(job.snapshot())
    }

    /// Remove a finished job on behalf of its owner
    ///
    /// Refused with `JobStillRunning` until the supervisor task has persisted
    /// and announced the final record, so a stop followed at once by a
    /// delete may need a retry.
    pub async fn delete(&self, job_id: &str, owner_id: &str) -> CoordinatorResult<()> {
        let job = self.inner.registry.get(job_id)?;
        if job.owner_id() != owner_id {
            return Err(CoordinatorError::NotOwner {
                job_id: job_id.to_string(),
            });
        }

        self.inner.registry.remove(job_id)?;
        self.inner.broadcaster.remove(job_id);
        if let Err(e) = self.inner.sink.job_deleted(job_id).await {
            warn!(job_id, error = %e, "Failed to delete persisted job");
        }
        info!(job_id, "Job deleted");
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> CoordinatorResult<JobSnapshot> {
        Ok(self.inner.registry.get(job_id)?.snapshot())
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|job| job.snapshot())
            .collect()
    }

    pub fn list_for_owner(&self, owner_id: &str) -> Vec<JobSnapshot> {
        self.inner
            .registry
            .list()
            .iter()
            .filter(|job| job.owner_id() == owner_id)
            .map(|job| job.snapshot())
            .collect()
    }

    /// Live stream of a job: history so far, then new events
    pub fn subscribe(&self, job_id: &str) -> CoordinatorResult<Subscription> {
        self.inner.registry.get(job_id)?;
        self.inner.broadcaster.subscribe(job_id)
    }

    /// Poll answer for a job's progress
    ///
    /// Reads the progress hash; when it is missing or the store cannot be
    /// reached, falls back to what the registry knows. Unknown ids are
    /// `JobNotFound`.
    pub async fn progress(&self, job_id: &str) -> CoordinatorResult<ProgressReport> {
        match self.inner.progress.report(job_id).await {
            Ok(Some(report)) => return Ok(report),
            Ok(None) => {}
            Err(e) if self.inner.registry.contains(job_id) => {
                warn!(job_id, error = %e, "Progress store unreadable, reporting from registry");
            }
            Err(e) => return Err(e.into()),
        }
        let job = self.inner.registry.get(job_id)?;
        Ok(ProgressReport::from_job(&job))
    }

    /// Outstanding admission slots for a model
    pub async fn slots(&self, model: &str) -> CoordinatorResult<u64> {
        Ok(self.inner.admission.current(&limit_key(model)).await?)
    }
}

async fn run_job(
    inner: Arc<CoordinatorInner>,
    job: Arc<Job>,
    services: Vec<String>,
    admitted_tx: oneshot::Sender<Result<AdmissionMode, AdmissionError>>,
) {
    let job_id = job.id().to_string();
    inner
        .broadcaster
        .publish(&job_id, ProgressEvent::output("task started"));

    if let Err(e) = inner.progress.init(&job_id).await {
        warn!(error = %e, "Failed to initialize progress hash");
    }

    let Some(admission) = admit(&inner, &job, admitted_tx).await else {
        // A job that never got a slot leaves no progress hash behind
        if let Err(e) = inner.progress.clear(&job_id).await {
            debug!(error = %e, "Failed to clear progress hash of unadmitted job");
        }
        finish(&inner, &job).await;
        return;
    };

    if job.cancel_handle().is_cancelled() {
        debug!("Stopped before the worker was launched");
    } else {
        let command = WorkerCommand::for_job(&job, &services, &inner.config.worker);
        match inner.launcher.start(&command).await {
            Ok(process) => match supervise(&inner, &job, process).await {
                Ok(Some(exit)) => complete(&inner, &job, exit).await,
                Ok(None) => debug!("Worker killed after stop"),
                Err(e) => {
                    error!(error = %e, "Worker wait failed");
                    inner.broadcaster.publish(
                        &job_id,
                        ProgressEvent::error(format!("worker wait failed: {e}")),
                    );
                    job.try_finalize(Termination::new(JobStatus::Error, FAILED_RETURN_CODE, None));
                }
            },
            Err(e) => {
                error!(error = %e, "Worker failed to start");
                inner.broadcaster.publish(
                    &job_id,
                    ProgressEvent::error(format!("failed to start worker: {e}")),
                );
                job.try_finalize(Termination::new(JobStatus::Error, FAILED_RETURN_CODE, None));
            }
        }
    }

    admission.release().await;
    finish(&inner, &job).await;
}

/// Wait for a slot. `None` means the job will not run; its terminal record
/// is already claimed (by this function or by a stop).
async fn admit(
    inner: &CoordinatorInner,
    job: &Job,
    admitted_tx: oneshot::Sender<Result<AdmissionMode, AdmissionError>>,
) -> Option<Admission> {
    let target = &job.params().model;
    let key = limit_key(&target.model);
    let max_concurrency = target
        .max_concurrency
        .unwrap_or(inner.config.admission.default_max_concurrency);

    let result = inner
        .admission
        .acquire(
            &key,
            max_concurrency,
            inner.config.admission.max_wait,
            job.cancel_handle(),
        )
        .await;

    match result {
        Ok(admission) => {
            let mode = match &admission {
                Admission::Granted(_) => AdmissionMode::Limited,
                Admission::Degraded { reason, .. } => {
                    inner.broadcaster.publish(
                        job.id(),
                        ProgressEvent::output(format!(
                            "admission store unavailable, running without concurrency limit: {reason}"
                        )),
                    );
                    AdmissionMode::Degraded
                }
            };
            job.record_admission(mode);
            let _ = admitted_tx.send(Ok(mode));
            Some(admission)
        }
        Err(e @ AdmissionError::Cancelled { .. }) => {
            debug!("Admission wait cancelled by stop");
            let _ = admitted_tx.send(Err(e));
            None
        }
        Err(e) => {
            warn!(error = %e, "Admission failed");
            inner
                .broadcaster
                .publish(job.id(), ProgressEvent::error(format!("admission failed: {e}")));
            job.try_finalize(Termination::new(JobStatus::Error, FAILED_RETURN_CODE, None));
            let _ = admitted_tx.send(Err(e));
            None
        }
    }
}

/// Run a launched worker to completion or until the job is cancelled.
/// Returns `None` when it was killed because of a stop.
async fn supervise(
    inner: &Arc<CoordinatorInner>,
    job: &Job,
    mut process: Box<dyn WorkerProcess>,
) -> Result<Option<WorkerExit>, WorkerError> {
    job.set_phase(JobPhase::Running);
    info!(pid = ?process.id(), "Worker launched");

    let readers = [
        process.stdout_lines().map(|s| (s, OutputSource::Stdout)),
        process.stderr_lines().map(|s| (s, OutputSource::Stderr)),
    ];
    let pumps: Vec<_> = readers
        .into_iter()
        .flatten()
        .map(|(lines, source)| {
            tokio::spawn(
                pump(inner.clone(), job.id().to_string(), lines, source).in_current_span(),
            )
        })
        .collect();

    let outcome = tokio::select! {
        status = process.wait() => match status {
            Ok(exit) => Ok(Some(exit)),
            Err(e) => {
                if let Err(kill_err) = process.kill().await {
                    warn!(error = %kill_err, "Failed to kill worker after wait error");
                }
                Err(e)
            }
        },
        _ = job.cancel_handle().cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(error = %e, "Failed to kill worker");
            }
            if let Err(e) = process.wait().await {
                debug!(error = %e, "Failed to reap killed worker");
            }
            Ok(None)
        }
    };

    for mut pump in pumps {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
            warn!("Output reader still open after worker exit, abandoning it");
            pump.abort();
        }
    }

    if let Ok(Some(exit)) = &outcome {
        info!(return_code = exit.return_code(), "Worker exited");
    }
    outcome
}

async fn pump(
    inner: Arc<CoordinatorInner>,
    job_id: String,
    mut lines: LineStream,
    source: OutputSource,
) {
    use futures::StreamExt;

    while let Some(item) = lines.next().await {
        match item {
            Ok(line) => {
                debug!(target: "taskhub::worker", stream = source.as_str(), "{}", line);
                inner
                    .broadcaster
                    .publish(&job_id, classify_line(source, &line));
            }
            Err(e) => {
                warn!(stream = source.as_str(), error = %e, "Stopped reading worker output");
                break;
            }
        }
    }
}

/// Natural completion: snapshot counters, then try to claim
async fn complete(inner: &CoordinatorInner, job: &Job, exit: WorkerExit) {
    if !job.is_running() {
        debug!("Job already finalized by stop, ignoring natural exit");
        return;
    }

    let counters = match inner.progress.final_counters(job.id()).await {
        Ok(counters) => Some(counters),
        Err(e) => {
            warn!(error = %e, "Could not read final progress counters");
            None
        }
    };

    let status = if exit.success() {
        JobStatus::Finished
    } else {
        JobStatus::Error
    };
    if !job.try_finalize(Termination::new(status, exit.return_code(), counters)) {
        debug!("Lost finalize race to stop");
    }
}

/// Persist and announce the winning terminal record
async fn finish(inner: &CoordinatorInner, job: &Job) {
    if job.is_running() {
        job.try_finalize(Termination::new(JobStatus::Error, FAILED_RETURN_CODE, None));
    }

    let record = JobRecord::from_job(job);
    if let Err(e) = inner.sink.job_finished(&record).await {
        warn!(job_id = %job.id(), error = %e, "Failed to persist final status");
    }

    let return_code = record.return_code.unwrap_or(FAILED_RETURN_CODE);
    inner
        .broadcaster
        .publish(job.id(), ProgressEvent::finished(return_code));
    // Deletion is refused until here
    job.set_phase(JobPhase::Done);
    info!(
        job_id = %job.id(),
        status = %record.status,
        return_code,
        run_time = ?job.run_time(),
        "Job finished"
    );
}
