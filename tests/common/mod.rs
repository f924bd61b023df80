//! Common test utilities and helpers

#![allow(dead_code)]

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskhub::config::CoordinatorConfig;
use taskhub::events::{EventKind, ProgressEvent};
use taskhub::job::{JobParams, JobPhase, ModelTarget};
use taskhub::sink::MemoryJobSink;
use taskhub::store::MemoryStore;
use taskhub::Coordinator;
use tempfile::TempDir;

/// Upper bound for any single wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// A coordinator over an in-process store whose workers run a shell script
pub struct TestHarness {
    pub coordinator: Coordinator,
    pub store: MemoryStore,
    pub sink: Arc<MemoryJobSink>,
    temp_dir: TempDir,
}

impl TestHarness {
    /// Harness whose worker runs `script` with `sh`
    ///
    /// The worker receives the usual flag vector as positional parameters;
    /// scripts simply ignore them.
    pub fn new(script: &str) -> Result<Self> {
        Self::with_config(script, |_| {})
    }

    pub fn with_config<F>(script: &str, adjust: F) -> Result<Self>
    where
        F: FnOnce(&mut CoordinatorConfig),
    {
        let temp_dir = TempDir::new()?;
        let script_path = write_script(temp_dir.path(), "worker.sh", script)?;

        let mut config = test_config(&script_path);
        config.worker.working_dir = Some(temp_dir.path().to_path_buf());
        adjust(&mut config);

        let store = MemoryStore::new();
        let sink = Arc::new(MemoryJobSink::new());
        let coordinator = Coordinator::builder(config, Arc::new(store.clone()))
            .sink(sink.clone())
            .build();

        Ok(Self {
            coordinator,
            store,
            sink,
            temp_dir,
        })
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a marker file in the worker's directory, releasing a worker
    /// blocked on it with [`wait_for_marker`]
    pub fn touch(&self, name: &str) -> Result<()> {
        fs::write(self.temp_dir.path().join(name), "")?;
        Ok(())
    }

    /// Subscribe and collect every event up to and including `finished`
    pub async fn events(&self, job_id: &str) -> Result<Vec<ProgressEvent>> {
        use futures::StreamExt;

        let stream = self.coordinator.subscribe(job_id)?.into_events();
        let events = tokio::time::timeout(TEST_TIMEOUT, stream.collect::<Vec<_>>()).await?;
        Ok(events)
    }

    /// Wait until the job's history contains an event matching `predicate`
    pub async fn wait_for_event<P>(&self, job_id: &str, predicate: P) -> Result<ProgressEvent>
    where
        P: Fn(&ProgressEvent) -> bool,
    {
        use futures::StreamExt;

        let mut stream = self.coordinator.subscribe(job_id)?.into_events();
        let found = tokio::time::timeout(TEST_TIMEOUT, async {
            while let Some(event) = stream.next().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await?;
        found.ok_or_else(|| anyhow::anyhow!("job {job_id} finished without the expected event"))
    }

    /// Wait until the job reaches a terminal status
    pub async fn wait_terminal(&self, job_id: &str) -> Result<()> {
        self.events(job_id).await.map(|_| ())
    }

    /// Wait until the supervisor task has persisted and announced the job
    pub async fn wait_done(&self, job_id: &str) -> Result<()> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while self.coordinator.status(job_id)?.phase != JobPhase::Done {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        })
        .await?
    }
}

/// Configuration running `sh <script>` with fast admission backoff
pub fn test_config(script: &Path) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.worker.program = "sh".to_string();
    config.worker.entrypoint = Some(script.display().to_string());
    config.worker.default_services = vec!["http://127.0.0.1:8000/v1".to_string()];
    config.admission.initial_backoff = Duration::from_millis(20);
    config.admission.max_backoff = Duration::from_millis(100);
    config.admission.max_wait = Duration::from_secs(10);
    config
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    Ok(path)
}

/// Shell loop blocking until the marker file `name` exists in the
/// worker's directory
pub fn wait_for_marker(name: &str) -> String {
    format!("while [ ! -f '{name}' ]; do sleep 0.05; done\n")
}

pub fn params(owner: &str, model: &str) -> JobParams {
    JobParams::new(owner, "file-1", ModelTarget::new(model))
}

pub fn kinds(events: &[ProgressEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

pub fn finished_events(events: &[ProgressEvent]) -> Vec<&ProgressEvent> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::Finished)
        .collect()
}
