//! Pipeline lifecycle integration tests.
//!
//! These tests run whole jobs through the scheduler and orchestrator with
//! mock stage adapters:
//! - Validation failures halting a job before inference
//! - Deadlines, retries and attempt accounting
//! - PACS acknowledgments and delivery
//! - Cooperative cancellation and slot release
//! - Audit log ordering and terminal idempotence

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use worklist_core::{
    config::Config,
    job::NewJob,
    orchestrator::AdvanceOutcome,
    scheduler::PoolKind,
    testing::{fixtures, mock_adapter_set, MockAdapter, MockFailure, MockStep},
    ArtifactType, AuditEvent, ErrorKind, Job, JobOptions, JobOrchestrator, JobStatus, JobStore,
    RetryManager, Scheduler, SqliteJobStore, Stage, ValidationGate,
};

const JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Test helper wiring a store, mock adapters and a running scheduler.
struct TestHarness {
    store: Arc<SqliteJobStore>,
    mocks: [Arc<MockAdapter>; 4],
    scheduler: Arc<Scheduler>,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = fixtures::harness_config(temp_dir.path());
        adjust(&mut config);

        let store =
            Arc::new(SqliteJobStore::new(&config.database.path).expect("Failed to create store"));
        let mocks = MockAdapter::for_all_stages();

        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            mock_adapter_set(&mocks),
            ValidationGate::new(config.validation.clone()),
            RetryManager::new(config.retry.clone()),
            config.pipeline.clone(),
        )
        .with_cancel_check_interval(config.scheduler.cancel_check_interval());

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::new(orchestrator),
        ));

        Self {
            store,
            mocks,
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    fn mock(&self, stage: Stage) -> &Arc<MockAdapter> {
        &self.mocks[Stage::ALL.iter().position(|s| *s == stage).unwrap()]
    }

    fn submit(&self, study_reference: &str) -> Job {
        self.submit_with(study_reference, JobOptions::default())
    }

    fn submit_with(&self, study_reference: &str, options: JobOptions) -> Job {
        let job = self
            .store
            .create(NewJob::new(study_reference, options))
            .expect("Failed to create job");
        self.scheduler.admit(&job);
        job
    }

    async fn wait_for(&self, job_id: &str, predicate: impl Fn(&Job) -> bool) -> Job {
        let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
        loop {
            let job = self.store.get(job_id).unwrap().expect("job exists");
            if predicate(&job) {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {} stuck in {} at {} after {:?}",
                    job_id, job.status, job.stage, JOB_TIMEOUT
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_terminal(&self, job_id: &str) -> Job {
        self.wait_for(job_id, |job| job.is_terminal()).await
    }
}

fn events(job: &Job) -> Vec<(Stage, AuditEvent)> {
    job.audit_log.iter().map(|e| (e.stage, e.event)).collect()
}

/// Stages recorded in the audit log never move backwards.
fn assert_stage_order(job: &Job) {
    for pair in job.audit_log.windows(2) {
        assert!(
            pair[0].stage <= pair[1].stage,
            "audit log of {} goes from {} back to {}",
            job.id,
            pair[0].stage,
            pair[1].stage
        );
        assert!(pair[0].seq < pair[1].seq);
    }
}

#[tokio::test]
async fn test_job_completes_all_stages() {
    let harness = TestHarness::new();
    harness.scheduler.start();

    let job = harness.submit("1.2.840.113619.2.55");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.stage, Stage::Store);
    assert!(job.delivery.is_some());
    assert!(job.error_info.is_none());
    for stage in Stage::ALL {
        assert_eq!(job.attempts.get(stage), 1, "attempts at {}", stage);
    }

    // Exactly one SEG, validated by the gate
    let artifacts = harness.store.artifacts(&job.id).unwrap();
    let segs: Vec<_> = artifacts
        .iter()
        .filter(|a| a.artifact_type == ArtifactType::Seg)
        .collect();
    assert_eq!(segs.len(), 1);
    assert!(segs[0].metadata.segment_count.is_some());
    assert_eq!(
        job.delivery.as_ref().unwrap().artifact_id,
        segs[0].id,
        "delivery refers to the SEG"
    );

    // Each stage consumed the previous stage's artifact
    let infer_calls = harness.mock(Stage::Infer).recorded_calls().await;
    let nifti = artifacts
        .iter()
        .find(|a| a.artifact_type == ArtifactType::Nifti)
        .unwrap();
    assert_eq!(infer_calls[0].input_artifact_id.as_deref(), Some(nifti.id.as_str()));

    assert_stage_order(&job);
    assert_eq!(
        job.audit_log.last().map(|e| e.event),
        Some(AuditEvent::Completed)
    );

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_invalid_study_fails_before_inference() {
    let harness = TestHarness::new();
    harness
        .mock(Stage::Preprocess)
        .push_steps([MockStep::Invalid])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Stage::Preprocess);
    let error = job.error_info.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::PermanentValidation);
    assert_eq!(error.attempt, 1);

    // received -> preprocessing -> failed, never inferring
    let statuses: Vec<JobStatus> = job.audit_log.iter().map(|e| e.status).collect();
    assert_eq!(statuses.first(), Some(&JobStatus::Received));
    assert!(statuses.contains(&JobStatus::Preprocessing));
    assert_eq!(statuses.last(), Some(&JobStatus::Failed));
    assert!(!statuses.contains(&JobStatus::Inferring));
    assert!(events(&job).contains(&(Stage::Preprocess, AuditEvent::ValidationFailed)));

    assert_eq!(harness.mock(Stage::Preprocess).call_count().await, 1);
    assert_eq!(harness.mock(Stage::Infer).call_count().await, 0);
    assert!(harness.store.artifacts(&job.id).unwrap().is_empty());

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_inference_deadline_exhausts_attempts() {
    let harness = TestHarness::with_config(|config| {
        config.retry.infer.max_attempts = 3;
        config.retry.infer.timeout_ms = 50;
    });
    harness
        .mock(Stage::Infer)
        .push_steps([MockStep::Hang, MockStep::Hang, MockStep::Hang])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Stage::Infer);
    assert_eq!(job.attempts.infer, 3);
    let error = job.error_info.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Transient);
    assert_eq!(error.attempt, 3);

    let retries = events(&job)
        .iter()
        .filter(|e| **e == (Stage::Infer, AuditEvent::RetryScheduled))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(harness.mock(Stage::Infer).call_count().await, 3);
    assert_eq!(harness.mock(Stage::Postprocess).call_count().await, 0);
    assert_stage_order(&job);

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_unacknowledged_store_retries_then_completes() {
    let harness = TestHarness::with_config(|config| {
        config.retry.store.max_attempts = 3;
    });
    harness
        .mock(Stage::Store)
        .push_steps([
            MockStep::Fail(MockFailure::NotAcknowledged),
            MockStep::Fail(MockFailure::NotAcknowledged),
        ])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.attempts.store, 3);
    assert!(job.delivery.is_some());

    let store_entries: Vec<_> = job
        .audit_log
        .iter()
        .filter(|e| e.stage == Stage::Store)
        .filter(|e| e.event != AuditEvent::StageStarted)
        .collect();
    assert_eq!(store_entries.len(), 4);
    for entry in &store_entries[..2] {
        assert_eq!(entry.event, AuditEvent::RetryScheduled);
        assert!(entry.detail.as_deref().unwrap().contains("transient"));
    }
    assert_eq!(store_entries[2].event, AuditEvent::StageCompleted);
    assert_eq!(store_entries[3].event, AuditEvent::Completed);

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_rejected_store_keeps_artifacts() {
    let harness = TestHarness::with_config(|config| {
        config.retry.store.max_attempts = 2;
    });
    harness
        .mock(Stage::Store)
        .push_steps([
            MockStep::Fail(MockFailure::PacsRejected("0xA700".to_string())),
            MockStep::Fail(MockFailure::PacsRejected("0xA700".to_string())),
        ])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_info.as_ref().unwrap().kind, ErrorKind::PacsRejection);
    assert!(job.delivery.is_none());

    // Outputs stay on disk for manual delivery
    let seg = harness
        .store
        .artifacts(&job.id)
        .unwrap()
        .into_iter()
        .find(|a| a.artifact_type == ArtifactType::Seg)
        .expect("SEG retained");
    let path = worklist_core::job::path_from_uri(&seg.location).unwrap();
    assert!(path.exists());

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_cancel_while_inferring_releases_slot() {
    let harness = TestHarness::new();
    harness.mock(Stage::Infer).push_steps([MockStep::Hang]).await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    harness
        .wait_for(&job.id, |job| job.status == JobStatus::Inferring)
        .await;
    assert_eq!(harness.scheduler.pools().in_use(PoolKind::Accelerator), 1);

    let flagged = harness.store.request_cancel(&job.id).unwrap();
    assert!(flagged.cancel_requested);
    assert_eq!(flagged.status, JobStatus::Inferring);
    harness.scheduler.notify_cancel(&flagged);

    let job = harness.wait_for_terminal(&job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.stage, Stage::Infer);
    assert_eq!(
        job.audit_log.last().map(|e| e.event),
        Some(AuditEvent::Cancelled)
    );

    harness
        .wait_for(&job.id, |_| {
            harness.scheduler.pools().in_use(PoolKind::Accelerator) == 0
        })
        .await;
    assert_eq!(harness.mock(Stage::Postprocess).call_count().await, 0);

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_cancel_without_abort_discards_result() {
    let temp_dir = TempDir::new().unwrap();
    let config = fixtures::harness_config(temp_dir.path());
    let store = Arc::new(SqliteJobStore::new(&config.database.path).unwrap());

    let mut mocks = MockAdapter::for_all_stages();
    let infer = Arc::new(MockAdapter::new(Stage::Infer).without_abort());
    infer.set_delay(Duration::from_millis(200));
    mocks[1] = Arc::clone(&infer);

    let orchestrator = Arc::new(
        JobOrchestrator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            mock_adapter_set(&mocks),
            ValidationGate::new(config.validation.clone()),
            RetryManager::new(config.retry.clone()),
            config.pipeline.clone(),
        )
        .with_cancel_check_interval(Duration::from_millis(10)),
    );

    let job = store
        .create(NewJob::new("1.2.3", JobOptions::default()))
        .unwrap();
    assert!(matches!(
        orchestrator.advance(&job.id).await.unwrap(),
        AdvanceOutcome::Advanced(_)
    ));

    let step = {
        let orchestrator = Arc::clone(&orchestrator);
        let job_id = job.id.clone();
        tokio::spawn(async move { orchestrator.advance(&job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.request_cancel(&job.id).unwrap();

    let outcome = step.await.unwrap().unwrap();
    let AdvanceOutcome::Terminal(job) = outcome else {
        panic!("expected a terminal outcome, got {:?}", outcome);
    };
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(infer.call_count().await, 1);

    // The segmentation ran to completion but was never recorded
    let artifacts = store.artifacts(&job.id).unwrap();
    assert!(artifacts
        .iter()
        .all(|a| a.artifact_type != ArtifactType::Segmentation));
}

#[tokio::test]
async fn test_resource_exhaustion_is_not_an_attempt() {
    let harness = TestHarness::new();
    harness
        .mock(Stage::Infer)
        .push_steps([
            MockStep::Fail(MockFailure::ResourceExhausted),
            MockStep::Fail(MockFailure::ResourceExhausted),
            MockStep::Fail(MockFailure::ResourceExhausted),
        ])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    // Three requeues against a budget of two attempts, still complete
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.attempts.infer, 1);
    let requeues = events(&job)
        .iter()
        .filter(|e| **e == (Stage::Infer, AuditEvent::Requeued))
        .count();
    assert_eq!(requeues, 3);

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_counted_resource_exhaustion_fails_job() {
    let harness = TestHarness::with_config(|config| {
        config.retry.count_resource_exhaustion = true;
    });
    harness
        .mock(Stage::Infer)
        .push_steps([
            MockStep::Fail(MockFailure::ResourceExhausted),
            MockStep::Fail(MockFailure::ResourceExhausted),
        ])
        .await;
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let job = harness.wait_for_terminal(&job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts.infer, 2);
    assert_eq!(
        job.error_info.as_ref().unwrap().kind,
        ErrorKind::ResourceExhausted
    );

    harness.scheduler.stop().await;
}

#[tokio::test]
async fn test_advance_on_terminal_job_is_noop() {
    let harness = TestHarness::new();
    harness.scheduler.start();

    let job = harness.submit("1.2.3");
    let done = harness.wait_for_terminal(&job.id).await;
    harness.scheduler.stop().await;

    let orchestrator = harness.scheduler.orchestrator();
    for _ in 0..3 {
        let outcome = orchestrator.advance(&job.id).await.unwrap();
        let AdvanceOutcome::Terminal(again) = outcome else {
            panic!("expected terminal outcome");
        };
        assert_eq!(again.status, done.status);
        assert_eq!(again.version, done.version);
        assert_eq!(again.audit_log.len(), done.audit_log.len());
    }
}

#[tokio::test]
async fn test_interrupted_jobs_resume_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = fixtures::harness_config(temp_dir.path());

    let build = |mocks: &[Arc<MockAdapter>; 4]| {
        let store = Arc::new(SqliteJobStore::new(&config.database.path).unwrap());
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            mock_adapter_set(mocks),
            ValidationGate::new(config.validation.clone()),
            RetryManager::new(config.retry.clone()),
            config.pipeline.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            Arc::new(orchestrator),
        ));
        (store, scheduler)
    };

    // First run stops while inference hangs
    let first_mocks = MockAdapter::for_all_stages();
    first_mocks[1].push_steps([MockStep::Hang]).await;
    let (store, scheduler) = build(&first_mocks);
    scheduler.start();
    let job = store
        .create(NewJob::new("1.2.3", JobOptions::default()))
        .unwrap();
    scheduler.admit(&job);

    let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
    while store.get(&job.id).unwrap().unwrap().status != JobStatus::Inferring {
        assert!(tokio::time::Instant::now() < deadline, "never reached inferring");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;

    let resting = store.get(&job.id).unwrap().unwrap();
    assert_eq!(resting.status, JobStatus::Preprocessed);
    assert_eq!(resting.attempts.infer, 0);
    assert!(events(&resting).contains(&(Stage::Infer, AuditEvent::Interrupted)));

    // Second run picks the job up from the store
    let second_mocks = MockAdapter::for_all_stages();
    let (store, scheduler) = build(&second_mocks);
    scheduler.start();
    let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
    let job = loop {
        let job = store.get(&job.id).unwrap().unwrap();
        if job.is_terminal() {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never resumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    scheduler.stop().await;

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(second_mocks[0].call_count().await, 0);
    assert_eq!(second_mocks[1].call_count().await, 1);
    assert_stage_order(&job);
}
