//! End-to-end tests of job supervision with real `sh` workers

mod common;

use async_trait::async_trait;
use common::{finished_events, kinds, params, test_config, wait_for_marker, TestHarness};
use futures::StreamExt;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskhub::events::EventKind;
use taskhub::job::{AdmissionMode, FinalCounters, JobPhase, ModelTarget};
use taskhub::progress::ReportSource;
use taskhub::sink::MemoryJobSink;
use taskhub::store::{limit_key, MemoryStore};
use taskhub::supervisor::{
    LineStream, WorkerCommand, WorkerError, WorkerExit, WorkerLauncher, WorkerProcess,
};
use taskhub::{Coordinator, CoordinatorError, JobStatus};

fn limited(mut params: taskhub::JobParams, max_concurrency: u32) -> taskhub::JobParams {
    params.model.max_concurrency = Some(max_concurrency);
    params
}

fn counters(input: u64, output: u64) -> Vec<(String, String)> {
    vec![
        ("input_chars".to_string(), input.to_string()),
        ("output_chars".to_string(), output.to_string()),
    ]
}

#[tokio::test]
async fn test_events_keep_worker_order() {
    let harness = TestHarness::new(
        r#"echo '{"progress":{"round":1}}'
echo 'warming up'
echo '{"result":{"id":5}}'
"#,
    )
    .unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    let events = harness.events(&job_id).await.unwrap();

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Output,
            EventKind::Progress,
            EventKind::Output,
            EventKind::Result,
            EventKind::Finished,
        ]
    );
    assert_eq!(events[0].line.as_deref(), Some("task started"));
    assert_eq!(events[1].data, Some(json!({"round": 1})));
    assert_eq!(events[2].line.as_deref(), Some("warming up"));
    assert_eq!(events[3].data, Some(json!({"id": 5})));
    assert_eq!(events[4].return_code, Some(0));

    harness.wait_done(&job_id).await.unwrap();
    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Finished);
    assert_eq!(snapshot.phase, JobPhase::Done);
    assert_eq!(snapshot.admission, Some(AdmissionMode::Limited));
    assert_eq!(snapshot.return_code, Some(0));
}

#[tokio::test]
async fn test_completion_freezes_progress_counters() {
    let script = format!("echo ready\n{}echo done\n", wait_for_marker("go"));
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();

    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("ready"))
        .await
        .unwrap();
    harness
        .coordinator
        .progress_store()
        .update(&job_id, &counters(120, 45))
        .await
        .unwrap();
    harness.touch("go").unwrap();
    harness.wait_terminal(&job_id).await.unwrap();

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Finished);
    assert_eq!(
        snapshot.final_counters,
        Some(FinalCounters {
            input_chars: 120,
            output_chars: 45,
        })
    );

    let record = harness.sink.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.input_chars, Some(120));
    assert_eq!(record.output_chars, Some(45));
    assert_eq!(harness.sink.finished_writes(&job_id).await, 1);
}

#[tokio::test]
async fn test_stop_keeps_counters_read_at_stop_time() {
    let script = format!("echo working\n{}echo late\n", wait_for_marker("never"));
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    assert_eq!(submitted.admitted().await.unwrap(), AdmissionMode::Limited);

    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("working"))
        .await
        .unwrap();
    harness
        .coordinator
        .progress_store()
        .update(&job_id, &counters(300, 80))
        .await
        .unwrap();

    let stopped = harness.coordinator.stop(&job_id, "alice").await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert_eq!(stopped.return_code, Some(-1));

    let events = harness.events(&job_id).await.unwrap();
    let finished = finished_events(&events);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].return_code, Some(-1));
    assert!(events.last().unwrap().is_terminal());
    assert!(events
        .iter()
        .any(|e| e.line.as_deref() == Some("task stopped by user")));
    assert!(!events.iter().any(|e| e.line.as_deref() == Some("late")));

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Stopped);
    assert_eq!(
        snapshot.final_counters,
        Some(FinalCounters {
            input_chars: 300,
            output_chars: 80,
        })
    );

    let record = harness.sink.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Stopped);
    assert_eq!(record.return_code, Some(-1));
    assert_eq!(record.input_chars, Some(300));
    assert_eq!(harness.sink.finished_writes(&job_id).await, 1);

    // The slot came back and the progress hash is gone
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 0);
    assert!(!harness.store.contains_key(&format!("task_progress:{job_id}")).await);
}

#[tokio::test]
async fn test_stop_racing_natural_exit() {
    let script = format!(
        "echo working\n{}sleep 0.25\nexit 0\n",
        wait_for_marker("go")
    );
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("working"))
        .await
        .unwrap();
    harness
        .coordinator
        .progress_store()
        .update(&job_id, &counters(7, 8))
        .await
        .unwrap();

    // Release the worker so its own exit lands just after the stop
    harness.touch("go").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = harness.coordinator.stop(&job_id, "alice").await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);

    let events = harness.events(&job_id).await.unwrap();
    harness.wait_done(&job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let finished = finished_events(&events);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].return_code, Some(-1));

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Stopped);
    assert_eq!(snapshot.return_code, Some(-1));
    assert_eq!(
        snapshot.final_counters,
        Some(FinalCounters {
            input_chars: 7,
            output_chars: 8,
        })
    );
    assert_eq!(harness.sink.finished_writes(&job_id).await, 1);
    assert_eq!(harness.sink.get(&job_id).await.unwrap().status, JobStatus::Stopped);
}

#[tokio::test]
async fn test_delete_right_after_stop_waits_for_finish() {
    let script = format!("echo working\n{}", wait_for_marker("never"));
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("working"))
        .await
        .unwrap();

    let live = harness.coordinator.subscribe(&job_id).unwrap();
    let reader = tokio::spawn(async move { live.into_events().collect::<Vec<_>>().await });

    harness.coordinator.stop(&job_id, "alice").await.unwrap();
    if let Err(e) = harness.coordinator.delete(&job_id, "alice").await {
        assert!(matches!(e, CoordinatorError::JobStillRunning(_)), "{e}");
        harness.wait_done(&job_id).await.unwrap();
        harness.coordinator.delete(&job_id, "alice").await.unwrap();
    }

    // The live subscriber still saw the job end
    let events = tokio::time::timeout(common::TEST_TIMEOUT, reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished_events(&events).len(), 1);
    assert_eq!(events.last().unwrap().return_code, Some(-1));

    // Nothing re-persisted the deleted job
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.sink.get(&job_id).await.is_none());
    assert!(harness.coordinator.status(&job_id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_stop_after_completion_is_rejected() {
    let harness = TestHarness::new("echo hi\n").unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    harness.wait_terminal(&job_id).await.unwrap();

    let err = harness.coordinator.stop(&job_id, "alice").await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::JobNotRunning {
            status: JobStatus::Finished,
            ..
        }
    ));
    assert_eq!(harness.sink.finished_writes(&job_id).await, 1);
}

#[tokio::test]
async fn test_nonzero_exit_is_error() {
    let harness = TestHarness::new("echo 'bad input' >&2\nexit 3\n").unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    let events = harness.events(&job_id).await.unwrap();

    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error && e.line.as_deref() == Some("bad input")));
    assert_eq!(events.last().unwrap().return_code, Some(3));

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Error);
    assert_eq!(snapshot.return_code, Some(3));
    // Counters are still captured on a failed run
    assert_eq!(
        snapshot.final_counters,
        Some(FinalCounters {
            input_chars: 0,
            output_chars: 0,
        })
    );
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 0);
}

#[tokio::test]
async fn test_spawn_failure_is_error_and_releases_slot() {
    let harness = TestHarness::with_config("echo unreachable\n", |config| {
        config.worker.program = "/nonexistent/taskhub-worker".to_string();
    })
    .unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    let events = harness.events(&job_id).await.unwrap();

    let error = events
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("spawn failure should be announced");
    assert!(error.line.as_deref().unwrap().contains("failed to start worker"));
    assert_eq!(finished_events(&events).len(), 1);
    assert_eq!(events.last().unwrap().return_code, Some(1));

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Error);
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 0);
    assert!(!harness.store.contains_key(&limit_key("qwen")).await);
}

#[tokio::test]
async fn test_store_outage_degrades_admission() {
    let harness = TestHarness::new("echo ran\n").unwrap();
    harness.store.set_available(false);

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    assert_eq!(submitted.admitted().await.unwrap(), AdmissionMode::Degraded);

    let events = harness.events(&job_id).await.unwrap();
    assert!(events.iter().any(|e| e
        .line
        .as_deref()
        .is_some_and(|l| l.contains("running without concurrency limit"))));
    assert!(events.iter().any(|e| e.line.as_deref() == Some("ran")));

    let snapshot = harness.coordinator.status(&job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Finished);
    assert_eq!(snapshot.admission, Some(AdmissionMode::Degraded));

    // Progress polling still answers from the registry
    let report = harness.coordinator.progress(&job_id).await.unwrap();
    assert_eq!(report.source, ReportSource::Memory);
    assert_eq!(report.status.as_deref(), Some("completed"));
}

#[tokio::test]
async fn test_store_outage_fails_job_in_strict_mode() {
    let harness = TestHarness::with_config("echo ran\n", |config| {
        config.admission.degrade_on_unavailable = false;
    })
    .unwrap();
    harness.store.set_available(false);

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    let err = submitted.admitted().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Admission(_)));

    let events = harness.events(&job_id).await.unwrap();
    assert!(!events.iter().any(|e| e.line.as_deref() == Some("ran")));
    assert_eq!(harness.coordinator.status(&job_id).unwrap().status, JobStatus::Error);
}

#[tokio::test]
async fn test_admission_timeout_is_reported() {
    let harness = TestHarness::with_config("echo never\n", |config| {
        config.admission.max_wait = Duration::from_millis(300);
    })
    .unwrap();

    // Another process holds the only slot
    let held = harness
        .coordinator
        .admission()
        .acquire(
            &limit_key("qwen"),
            1,
            Duration::from_secs(1),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await
        .unwrap();

    let submitted = harness
        .coordinator
        .submit(limited(params("alice", "qwen"), 1))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    let err = submitted.admitted().await.unwrap_err();
    assert!(err.to_string().contains("Timed out"), "{err}");

    let events = harness.events(&job_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error
            && e.line.as_deref().is_some_and(|l| l.contains("admission failed"))));
    assert!(!events.iter().any(|e| e.line.as_deref() == Some("never")));
    assert_eq!(harness.coordinator.status(&job_id).unwrap().status, JobStatus::Error);

    // No progress hash is left behind for a job that never ran
    assert!(!harness.store.contains_key(&format!("task_progress:{job_id}")).await);
    let report = harness.coordinator.progress(&job_id).await.unwrap();
    assert_eq!(report.source, ReportSource::Memory);
    assert_eq!(report.status.as_deref(), Some("failed"));

    // The timed-out job never held a slot
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 1);
    held.release().await;
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_while_waiting_for_admission() {
    let harness = TestHarness::new("echo never\n").unwrap();
    let held = harness
        .coordinator
        .admission()
        .acquire(
            &limit_key("qwen"),
            1,
            Duration::from_secs(1),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await
        .unwrap();

    let submitted = harness
        .coordinator
        .submit(limited(params("alice", "qwen"), 1))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();

    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.coordinator.stop(&job_id, "alice").await.unwrap();

    let events = harness.events(&job_id).await.unwrap();
    assert_eq!(finished_events(&events).len(), 1);
    assert!(!events.iter().any(|e| e.line.as_deref() == Some("never")));
    assert_eq!(harness.coordinator.status(&job_id).unwrap().status, JobStatus::Stopped);
    assert_eq!(harness.coordinator.slots("qwen").await.unwrap(), 1);
    held.release().await;
}

#[tokio::test]
async fn test_only_owner_may_stop_or_delete() {
    let script = format!("echo up\n{}", wait_for_marker("go"));
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("up"))
        .await
        .unwrap();

    let err = harness.coordinator.stop(&job_id, "mallory").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner { .. }));
    let err = harness.coordinator.delete(&job_id, "mallory").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotOwner { .. }));

    // A running job cannot be deleted, even by its owner
    let err = harness.coordinator.delete(&job_id, "alice").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::JobStillRunning(_)));

    harness.touch("go").unwrap();
    harness.wait_done(&job_id).await.unwrap();

    harness.coordinator.delete(&job_id, "alice").await.unwrap();
    assert!(harness.coordinator.status(&job_id).unwrap_err().is_not_found());
    assert!(harness.coordinator.subscribe(&job_id).is_err());
    assert!(harness.sink.get(&job_id).await.is_none());
}

#[tokio::test]
async fn test_submit_validation() {
    let harness = TestHarness::with_config("true\n", |config| {
        config.worker.default_services.clear();
    })
    .unwrap();

    let err = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::InvalidRequest(_)));

    let err = harness
        .coordinator
        .submit(params("", "qwen"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::InvalidRequest(_)));

    let mut zero_limit = params("alice", "qwen");
    zero_limit.model = ModelTarget::new("qwen")
        .with_services(["http://a"])
        .with_max_concurrency(0);
    let err = harness.coordinator.submit(zero_limit).await.err().unwrap();
    assert!(matches!(err, CoordinatorError::InvalidRequest(_)));

    assert!(harness.coordinator.list().is_empty());
}

#[tokio::test]
async fn test_duplicate_job_id_rejected() {
    let script = wait_for_marker("go");
    let harness = TestHarness::new(&script).unwrap();

    let first = harness
        .coordinator
        .submit(params("alice", "qwen").with_job_id("job-a"))
        .await
        .unwrap();
    let err = harness
        .coordinator
        .submit(params("bob", "qwen").with_job_id("job-a"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::JobAlreadyExists(_)));

    harness.touch("go").unwrap();
    harness.wait_terminal(first.job_id()).await.unwrap();
}

#[tokio::test]
async fn test_named_jobs_get_distinct_ids_and_owner_listing() {
    let harness = TestHarness::new("true\n").unwrap();

    let a = harness
        .coordinator
        .submit(params("alice", "qwen").with_name("nightly"))
        .await
        .unwrap();
    let b = harness
        .coordinator
        .submit(params("alice", "qwen").with_name("nightly"))
        .await
        .unwrap();
    let c = harness
        .coordinator
        .submit(params("bob", "qwen").with_name("other"))
        .await
        .unwrap();

    assert_eq!(a.job_id(), "nightly");
    assert_eq!(b.job_id(), "nightly_1");
    assert_eq!(c.job_id(), "other");

    for id in ["nightly", "nightly_1", "other"] {
        harness.wait_terminal(id).await.unwrap();
    }

    let alice: Vec<_> = harness
        .coordinator
        .list_for_owner("alice")
        .into_iter()
        .map(|s| s.job_id)
        .collect();
    assert_eq!(alice.len(), 2);
    assert!(alice.contains(&"nightly".to_string()));
    assert_eq!(harness.coordinator.list().len(), 3);
}

#[tokio::test]
async fn test_progress_report_sources() {
    let script = format!("echo up\n{}", wait_for_marker("go"));
    let harness = TestHarness::new(&script).unwrap();

    let submitted = harness
        .coordinator
        .submit(params("alice", "qwen"))
        .await
        .unwrap();
    let job_id = submitted.job_id().to_string();
    harness
        .wait_for_event(&job_id, |e| e.line.as_deref() == Some("up"))
        .await
        .unwrap();

    let fields = vec![
        ("current_round".to_string(), "3".to_string()),
        ("total_rounds".to_string(), "4".to_string()),
    ];
    harness
        .coordinator
        .progress_store()
        .update(&job_id, &fields)
        .await
        .unwrap();

    let report = harness.coordinator.progress(&job_id).await.unwrap();
    assert_eq!(report.source, ReportSource::Store);
    assert_eq!(report.progress_percent, 75.0);

    harness.coordinator.stop(&job_id, "alice").await.unwrap();
    let report = harness.coordinator.progress(&job_id).await.unwrap();
    assert_eq!(report.source, ReportSource::Memory);
    assert_eq!(report.status.as_deref(), Some("stopped"));

    let err = harness.coordinator.progress("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

struct PanickingLauncher;

#[async_trait]
impl WorkerLauncher for PanickingLauncher {
    async fn start(&self, _command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, WorkerError> {
        panic!("launcher exploded");
    }
}

#[tokio::test]
async fn test_panicking_job_task_finishes_once() {
    let sink = Arc::new(MemoryJobSink::new());
    let coordinator = Coordinator::builder(
        test_config(Path::new("unused.sh")),
        Arc::new(MemoryStore::new()),
    )
    .launcher(Arc::new(PanickingLauncher))
    .sink(sink.clone())
    .build();

    let submitted = coordinator.submit(params("alice", "qwen")).await.unwrap();
    let job_id = submitted.job_id().to_string();

    let events = tokio::time::timeout(
        common::TEST_TIMEOUT,
        coordinator
            .subscribe(&job_id)
            .unwrap()
            .into_events()
            .collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    assert_eq!(finished_events(&events).len(), 1);
    assert_eq!(events.last().unwrap().return_code, Some(1));
    assert!(events
        .iter()
        .any(|e| e.line.as_deref() == Some("internal error: job task panicked")));

    let snapshot = tokio::time::timeout(common::TEST_TIMEOUT, async {
        loop {
            let snapshot = coordinator.status(&job_id).unwrap();
            if snapshot.phase == JobPhase::Done {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(snapshot.status, JobStatus::Error);
    assert_eq!(sink.finished_writes(&job_id).await, 1);
}

/// Launches a worker that cannot be waited on
struct BrokenWaitLauncher {
    killed: Arc<AtomicBool>,
}

struct BrokenWaitProcess {
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerProcess for BrokenWaitProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn stdout_lines(&mut self) -> Option<LineStream> {
        None
    }

    fn stderr_lines(&mut self) -> Option<LineStream> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, WorkerError> {
        Err(WorkerError::Io(std::io::Error::other("wait interrupted")))
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for BrokenWaitLauncher {
    async fn start(&self, _command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, WorkerError> {
        Ok(Box::new(BrokenWaitProcess {
            killed: self.killed.clone(),
        }))
    }
}

#[tokio::test]
async fn test_wait_failure_is_not_reported_as_start_failure() {
    let killed = Arc::new(AtomicBool::new(false));
    let coordinator = Coordinator::builder(
        test_config(Path::new("unused.sh")),
        Arc::new(MemoryStore::new()),
    )
    .launcher(Arc::new(BrokenWaitLauncher {
        killed: killed.clone(),
    }))
    .build();

    let submitted = coordinator.submit(params("alice", "qwen")).await.unwrap();
    let job_id = submitted.job_id().to_string();
    let events = tokio::time::timeout(
        common::TEST_TIMEOUT,
        coordinator
            .subscribe(&job_id)
            .unwrap()
            .into_events()
            .collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    let errors: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::Error)
        .filter_map(|e| e.line.as_deref())
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("worker wait failed"), "{}", errors[0]);
    assert!(errors[0].contains("wait interrupted"));
    assert_eq!(events.last().unwrap().return_code, Some(1));

    assert!(killed.load(Ordering::SeqCst));
    assert_eq!(coordinator.status(&job_id).unwrap().status, JobStatus::Error);
    assert_eq!(coordinator.slots("qwen").await.unwrap(), 0);
}
