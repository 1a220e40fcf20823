//! Job orchestrator implementation.
//!
//! Each call to [`JobOrchestrator::advance`] runs at most one stage attempt:
//! mark the stage active, run its adapter under a deadline while watching
//! for cancellation, pass the output through the validation gate, then
//! commit the resulting transition with compare-and-set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, AdapterSet, ProducedArtifact, StageOutput, StageRequest};
use crate::job::{
    file_uri, Artifact, AuditEvent, DeliveryReceipt, ErrorInfo, ErrorKind, Job, JobStatus,
    JobStore, JobTransition, NewAuditEntry, Stage, StoreError,
};
use crate::metrics;
use crate::retry::{RetryDecision, RetryManager, StageFailure};
use crate::validation::ValidationGate;

use super::config::PipelineConfig;
use super::types::{AdvanceOutcome, OrchestratorError};

/// Compare-and-set attempts per write before giving up.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

const DEFAULT_CANCEL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Called after every committed transition with the job id and its new status.
pub type JobUpdateCallback = Arc<dyn Fn(&str, JobStatus) + Send + Sync>;

/// A failed attempt, classified.
#[derive(Debug, Clone)]
struct AttemptFailure {
    kind: ErrorKind,
    exit_code: Option<i32>,
    message: String,
}

/// Drives jobs through their stages, one step at a time.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    adapters: AdapterSet,
    gate: Arc<ValidationGate>,
    retry: RetryManager,
    pipeline: PipelineConfig,
    cancel_check_interval: Duration,

    // Runtime state
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
    on_update: Option<JobUpdateCallback>,
}

impl JobOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterSet,
        gate: ValidationGate,
        retry: RetryManager,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            gate: Arc::new(gate),
            retry,
            pipeline,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            on_update: None,
        }
    }

    /// How often a running stage polls the store for a cancel request.
    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    pub fn with_update_callback(mut self, callback: JobUpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Stops running stages. Interrupted jobs return to their resting status.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fires the abort signal of a stage running in this process.
    ///
    /// Returns `false` when the job has no stage in flight here.
    pub fn cancel_in_flight(&self, job_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match in_flight.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of stages currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Runs one step of the job's state machine.
    pub async fn advance(&self, job_id: &str) -> Result<AdvanceOutcome, OrchestratorError> {
        let job = self.load(job_id)?;

        if job.is_terminal() {
            return Ok(AdvanceOutcome::Terminal(job));
        }

        if job.cancel_requested {
            let job = self.cancel(job, None)?;
            return Ok(AdvanceOutcome::Terminal(job));
        }

        if job.status == JobStatus::Retrying {
            if let Some(until) = job.retry_at {
                if until > Utc::now() {
                    return Ok(AdvanceOutcome::NotReady { until });
                }
            }
        }

        if job.stage == Stage::Store && job.delivery.is_some() {
            let job = self.complete_delivered(job)?;
            return Ok(AdvanceOutcome::Terminal(job));
        }

        self.run_stage(job).await
    }

    /// Records that no execution slot became free for the job.
    ///
    /// The job stays at rest. With `retry.count_resource_exhaustion` the wait
    /// counts as an attempt and may fail the job.
    pub fn requeue_for_resources(
        &self,
        job_id: &str,
        waited: Duration,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let job = self.load(job_id)?;
        if job.is_terminal() {
            return Ok(AdvanceOutcome::Terminal(job));
        }

        let stage = job.stage;
        let resting = job.status;
        let attempt = job.attempts.get(stage) + 1;
        let kind = self.retry.classify(&StageFailure::NoSlot);
        let failure = AttemptFailure {
            kind,
            exit_code: None,
            message: format!("no execution slot within {} ms", waited.as_millis()),
        };
        let still_resting = |fresh: &Job| fresh.status == resting && fresh.stage == stage;

        match self.retry.decide(stage, attempt, kind, None) {
            RetryDecision::Fail => {
                let info = self.error_info(stage, attempt, &failure);
                let job = self.commit_step(
                    job,
                    |mut job| {
                        job.attempts.increment(stage);
                        job.status = JobStatus::Failed;
                        job.error_info = Some(info.clone());
                        JobTransition::new(job).audit(
                            NewAuditEntry::new(stage, AuditEvent::Failed)
                                .with_detail(failure.message.clone()),
                        )
                    },
                    still_resting,
                )?;
                metrics::TERMINAL_JOBS.with_label_values(&["failed"]).inc();
                error!("Job {} failed waiting for resources: {}", job.id, failure.message);
                Ok(AdvanceOutcome::Terminal(job))
            }
            _ => {
                let counted = self.retry.counts_resource_exhaustion();
                let job = self.commit_step(
                    job,
                    |mut job| {
                        if counted {
                            job.attempts.increment(stage);
                        }
                        JobTransition::new(job).audit(
                            NewAuditEntry::new(stage, AuditEvent::Requeued)
                                .with_detail(failure.message.clone()),
                        )
                    },
                    still_resting,
                )?;
                metrics::REQUEUES.with_label_values(&[stage.as_str()]).inc();
                debug!("Job {} requeued: {}", job.id, failure.message);
                Ok(AdvanceOutcome::Requeued(job))
            }
        }
    }

    fn load(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Commits `build(job)`, re-reading and re-applying on version conflicts
    /// while `still_applies` holds for the fresh copy.
    fn commit_step<B, P>(
        &self,
        job: Job,
        build: B,
        still_applies: P,
    ) -> Result<Job, OrchestratorError>
    where
        B: Fn(Job) -> JobTransition,
        P: Fn(&Job) -> bool,
    {
        let job_id = job.id.clone();
        let mut current = job;

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            match self.store.commit(build(current)) {
                Ok(job) => {
                    if let Some(callback) = &self.on_update {
                        callback(&job.id, job.status);
                    }
                    return Ok(job);
                }
                Err(StoreError::Conflict {
                    expected, actual, ..
                }) => {
                    metrics::VERSION_CONFLICTS.inc();
                    let fresh = self.load(&job_id)?;
                    if !still_applies(&fresh) {
                        debug!(
                            "Job {} changed to {} during step, abandoning write",
                            job_id, fresh.status
                        );
                        return Err(OrchestratorError::Conflict(job_id));
                    }
                    debug!(
                        "Version conflict on job {} ({} -> {}), re-applying",
                        job_id, expected, actual
                    );
                    current = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::Conflict(job_id))
    }

    fn error_info(&self, stage: Stage, attempt: u32, failure: &AttemptFailure) -> ErrorInfo {
        ErrorInfo {
            kind: failure.kind,
            exit_code: failure.exit_code,
            stage,
            attempt,
            message: failure.message.clone(),
            occurred_at: Utc::now(),
        }
    }

    fn cancel(&self, job: Job, receipt: Option<DeliveryReceipt>) -> Result<Job, OrchestratorError> {
        let stage = job.stage;
        let detail = if receipt.is_some() {
            "cancelled after PACS acknowledged the delivery"
        } else {
            "cancelled"
        };

        let job = self.commit_step(
            job,
            |mut job| {
                job.status = JobStatus::Cancelled;
                job.retry_at = None;
                if let Some(receipt) = &receipt {
                    job.delivery = Some(receipt.clone());
                }
                JobTransition::new(job)
                    .audit(NewAuditEntry::new(stage, AuditEvent::Cancelled).with_detail(detail))
            },
            |fresh| !fresh.is_terminal(),
        )?;

        metrics::TERMINAL_JOBS.with_label_values(&["cancelled"]).inc();
        info!("Job {} cancelled during {}", job.id, stage);
        Ok(job)
    }

    fn complete_delivered(&self, job: Job) -> Result<Job, OrchestratorError> {
        let job = self.commit_step(
            job,
            |mut job| {
                job.status = JobStatus::Complete;
                job.retry_at = None;
                JobTransition::new(job)
                    .audit(
                        NewAuditEntry::new(Stage::Store, AuditEvent::StageCompleted)
                            .with_detail("delivery already recorded"),
                    )
                    .audit(NewAuditEntry::new(Stage::Store, AuditEvent::Completed))
            },
            |fresh| !fresh.is_terminal() && fresh.stage == Stage::Store,
        )?;
        metrics::TERMINAL_JOBS.with_label_values(&["complete"]).inc();
        Ok(job)
    }

    async fn run_stage(&self, job: Job) -> Result<AdvanceOutcome, OrchestratorError> {
        let stage = job.stage;
        let resting = job.status;
        let active = stage.active_status();
        let attempt = job.attempts.get(stage) + 1;
        let detail = if resting.is_active() {
            format!("attempt {} (resumed)", attempt)
        } else {
            format!("attempt {}", attempt)
        };

        let started = match self.commit_step(
            job,
            |mut job| {
                job.status = active;
                job.retry_at = None;
                JobTransition::new(job).audit(
                    NewAuditEntry::new(stage, AuditEvent::StageStarted).with_detail(detail.clone()),
                )
            },
            |fresh| fresh.status == resting && fresh.stage == stage && !fresh.cancel_requested,
        ) {
            Ok(job) => job,
            Err(OrchestratorError::Conflict(job_id)) => {
                return self.cancel_after_conflict(job_id, stage)
            }
            Err(e) => return Err(e),
        };

        info!(
            "Job {} (study {}): starting {} attempt {}",
            started.id,
            started.log_reference(),
            stage,
            attempt
        );

        let input = match &started.input_artifact_id {
            Some(id) => self.store.get_artifact(id)?,
            None => None,
        };

        let clock = StdInstant::now();
        let result = self.execute(&started, attempt, input.clone()).await;
        metrics::STAGE_DURATION
            .with_label_values(&[stage.as_str()])
            .observe(clock.elapsed().as_secs_f64());

        let output_dir = result
            .as_ref()
            .ok()
            .and_then(|output| output.output_dir().map(PathBuf::from));

        let settled = match self.load(&started.id) {
            Ok(fresh) => self.settle(fresh, attempt, result, input.as_ref()).await,
            Err(e) => Err(e),
        };
        if settled.is_err() {
            self.discard_output(output_dir).await;
        }
        match settled {
            Err(OrchestratorError::Conflict(job_id)) => self.cancel_after_conflict(job_id, stage),
            other => other,
        }
    }

    /// Resolves a lost compare-and-set for a stage.
    ///
    /// A cancel that lands between reading the job and committing its next
    /// step shows up as a conflict. The job is cancelled here so it does not
    /// stay in an active status once its slot is released.
    fn cancel_after_conflict(
        &self,
        job_id: String,
        stage: Stage,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let fresh = self.load(&job_id)?;
        if !fresh.cancel_requested || fresh.is_terminal() || fresh.stage != stage {
            return Err(OrchestratorError::Conflict(job_id));
        }

        debug!("Job {} was cancelled while settling {}", job_id, stage);
        metrics::STAGE_EXECUTIONS
            .with_label_values(&[stage.as_str(), "cancelled"])
            .inc();
        let job = self.cancel(fresh, None)?;
        Ok(AdvanceOutcome::Terminal(job))
    }

    async fn execute(
        &self,
        job: &Job,
        attempt: u32,
        input: Option<Artifact>,
    ) -> Result<StageOutput, AdapterError> {
        let stage = job.stage;
        let adapter = self.adapters.get(stage);
        let timeout = self.retry.timeout(stage);
        let deadline = Instant::now() + timeout;

        let job_dir = self.pipeline.job_dir(&job.id);
        tokio::fs::create_dir_all(&job_dir).await?;

        let request = StageRequest {
            job_id: job.id.clone(),
            stage,
            attempt,
            study_reference: job.study_reference.clone(),
            dicom_dir: self.pipeline.dicom_dir(&job.study_reference),
            input,
            options: job.options.clone(),
            deadline,
            job_dir,
        };

        // Fires on cancel requests and on shutdown
        let abort = self.shutdown.child_token();
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), abort.clone());

        let watcher_done = CancellationToken::new();
        let watcher = self.spawn_cancel_watcher(job.id.clone(), abort.clone(), watcher_done.clone());

        let adapter_token = if adapter.supports_abort() {
            abort.clone()
        } else {
            CancellationToken::new()
        };

        let result = match tokio::time::timeout_at(deadline, adapter.execute(request, adapter_token))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                tool: adapter.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        watcher_done.cancel();
        if let Err(e) = watcher.await {
            warn!("Cancel watcher for job {} ended abnormally: {}", job.id, e);
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.id);

        result
    }

    /// Polls the store for a cancel request while a stage runs.
    fn spawn_cancel_watcher(
        &self,
        job_id: String,
        abort: CancellationToken,
        done: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.cancel_check_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = abort.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match store.get(&job_id) {
                            Ok(Some(job)) if job.cancel_requested => {
                                info!("Cancel requested for job {}, aborting stage", job_id);
                                abort.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Cancel check failed for job {}: {}", job_id, e),
                        }
                    }
                }
            }
        })
    }

    /// Turns the attempt's result into the next committed transition.
    async fn settle(
        &self,
        fresh: Job,
        attempt: u32,
        result: Result<StageOutput, AdapterError>,
        input: Option<&Artifact>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let stage = fresh.stage;
        let active = stage.active_status();

        if fresh.status != active {
            warn!(
                "Job {} left {} while its stage ran (now {}), discarding result",
                fresh.id, active, fresh.status
            );
            return Err(OrchestratorError::Conflict(fresh.id));
        }

        if fresh.cancel_requested {
            let receipt = match &result {
                Ok(StageOutput::Delivered(receipt)) => Some(receipt.clone()),
                _ => None,
            };
            if let Ok(output) = &result {
                self.discard_output(output.output_dir().map(PathBuf::from))
                    .await;
            }
            metrics::STAGE_EXECUTIONS
                .with_label_values(&[stage.as_str(), "cancelled"])
                .inc();
            let job = self.cancel(fresh, receipt)?;
            return Ok(AdvanceOutcome::Terminal(job));
        }

        let output = match result {
            Ok(output) => output,
            Err(e) if self.shutdown.is_cancelled() => {
                debug!("Job {} interrupted by shutdown: {}", fresh.id, e);
                let job = self.interrupt(fresh)?;
                return Ok(AdvanceOutcome::Interrupted(job));
            }
            Err(e) => {
                let failure = AttemptFailure {
                    kind: self.retry.classify(&StageFailure::Adapter(&e)),
                    exit_code: e.exit_code(),
                    message: e.detail(),
                };
                return self.record_failure(fresh, attempt, failure, None);
            }
        };

        match (stage, output) {
            (Stage::Store, StageOutput::Delivered(receipt)) => self.record_delivery(fresh, receipt),
            (Stage::Store, StageOutput::Artifact(produced)) => {
                self.discard_output(Some(produced.output_dir)).await;
                let failure = AttemptFailure {
                    kind: ErrorKind::PermanentValidation,
                    exit_code: None,
                    message: "store stage produced a file instead of a delivery".to_string(),
                };
                self.record_failure(fresh, attempt, failure, None)
            }
            (_, StageOutput::Artifact(produced)) => {
                self.inspect_and_accept(fresh, attempt, produced, input).await
            }
            (_, StageOutput::Delivered(_)) => {
                let failure = AttemptFailure {
                    kind: ErrorKind::PermanentValidation,
                    exit_code: None,
                    message: format!("{} stage reported a PACS delivery", stage),
                };
                self.record_failure(fresh, attempt, failure, None)
            }
        }
    }

    async fn inspect_and_accept(
        &self,
        fresh: Job,
        attempt: u32,
        produced: ProducedArtifact,
        input: Option<&Artifact>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let stage = fresh.stage;

        let gate = Arc::clone(&self.gate);
        let upstream = input.cloned();
        let candidate = produced.clone();
        let inspected =
            tokio::task::spawn_blocking(move || gate.inspect(&candidate, upstream.as_ref())).await;

        let report = match inspected {
            Ok(Ok(report)) => report,
            Ok(Err(rejection)) => {
                metrics::VALIDATION_FAILURES
                    .with_label_values(&[produced.artifact_type.as_str()])
                    .inc();
                warn!(
                    "Job {}: {} output rejected: {}",
                    fresh.id, stage, rejection
                );
                self.discard_output(Some(produced.output_dir)).await;
                let failure = AttemptFailure {
                    kind: self.retry.classify(&StageFailure::Validation(&rejection)),
                    exit_code: None,
                    message: rejection.to_string(),
                };
                let rejected = NewAuditEntry::new(stage, AuditEvent::ValidationFailed)
                    .with_detail(rejection.to_string());
                return self.record_failure(fresh, attempt, failure, Some(rejected));
            }
            Err(e) => {
                self.discard_output(Some(produced.output_dir)).await;
                let failure = AttemptFailure {
                    kind: ErrorKind::Transient,
                    exit_code: None,
                    message: format!("validation task failed: {}", e),
                };
                return self.record_failure(fresh, attempt, failure, None);
            }
        };

        let mut metadata = produced.metadata.clone();
        report.apply(&mut metadata);
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: fresh.id.clone(),
            stage,
            artifact_type: produced.artifact_type,
            location: file_uri(&produced.path),
            checksum: produced.checksum.clone(),
            produced_at: Utc::now(),
            metadata,
        };
        let next = stage.next().unwrap_or(stage);
        let active = stage.active_status();

        let committed = self.commit_step(
            fresh,
            |mut job| {
                job.attempts.increment(stage);
                job.attempts.reset(next);
                job.stage = next;
                job.status = next.waiting_status();
                job.input_artifact_id = Some(artifact.id.clone());
                job.error_info = None;
                JobTransition::new(job).artifact(artifact.clone()).audit(
                    NewAuditEntry::new(stage, AuditEvent::StageCompleted).with_detail(format!(
                        "{} artifact {}",
                        artifact.artifact_type, artifact.id
                    )),
                )
            },
            |job| job.status == active && job.stage == stage && !job.cancel_requested,
        );

        match committed {
            Ok(job) => {
                metrics::STAGE_EXECUTIONS
                    .with_label_values(&[stage.as_str(), "advanced"])
                    .inc();
                info!("Job {} completed {}, now {}", job.id, stage, job.status);
                Ok(AdvanceOutcome::Advanced(job))
            }
            Err(e) => {
                self.discard_output(Some(produced.output_dir)).await;
                Err(e)
            }
        }
    }

    fn record_delivery(
        &self,
        fresh: Job,
        receipt: DeliveryReceipt,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let active = Stage::Store.active_status();
        let destination = receipt.destination.clone();

        // A delivery that happened is recorded even if a cancel raced it
        let job = self.commit_step(
            fresh,
            |mut job| {
                job.attempts.increment(Stage::Store);
                job.status = JobStatus::Complete;
                job.delivery = Some(receipt.clone());
                job.error_info = None;
                JobTransition::new(job)
                    .audit(
                        NewAuditEntry::new(Stage::Store, AuditEvent::StageCompleted)
                            .with_detail(format!("delivered to {}", destination)),
                    )
                    .audit(NewAuditEntry::new(Stage::Store, AuditEvent::Completed))
            },
            |job| job.status == active && job.stage == Stage::Store,
        )?;

        metrics::PACS_DELIVERIES.inc();
        metrics::STAGE_EXECUTIONS
            .with_label_values(&[Stage::Store.as_str(), "advanced"])
            .inc();
        metrics::TERMINAL_JOBS.with_label_values(&["complete"]).inc();
        info!("Job {} complete, SEG delivered to {}", job.id, destination);
        Ok(AdvanceOutcome::Terminal(job))
    }

    fn record_failure(
        &self,
        fresh: Job,
        attempt: u32,
        failure: AttemptFailure,
        rejected: Option<NewAuditEntry>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let stage = fresh.stage;
        let active = stage.active_status();
        let info = self.error_info(stage, attempt, &failure);
        let still_active =
            |job: &Job| job.status == active && job.stage == stage && !job.cancel_requested;
        let with_rejection = |job: Job| {
            let transition = JobTransition::new(job);
            match &rejected {
                Some(entry) => transition.audit(entry.clone()),
                None => transition,
            }
        };

        match self
            .retry
            .decide(stage, attempt, failure.kind, failure.exit_code)
        {
            RetryDecision::Retry { delay } => {
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let job = self.commit_step(
                    fresh,
                    |mut job| {
                        job.attempts.increment(stage);
                        job.status = JobStatus::Retrying;
                        job.retry_at = Some(retry_at);
                        job.error_info = Some(info.clone());
                        with_rejection(job).audit(
                            NewAuditEntry::new(stage, AuditEvent::RetryScheduled).with_detail(
                                format!(
                                    "attempt {} failed ({}): {}; retry in {} ms",
                                    attempt,
                                    failure.kind,
                                    failure.message,
                                    delay.as_millis()
                                ),
                            ),
                        )
                    },
                    still_active,
                )?;
                metrics::STAGE_EXECUTIONS
                    .with_label_values(&[stage.as_str(), "retry"])
                    .inc();
                metrics::RETRIES_SCHEDULED
                    .with_label_values(&[stage.as_str(), failure.kind.as_str()])
                    .inc();
                warn!(
                    "Job {} {} attempt {} failed ({}), retrying in {} ms: {}",
                    job.id,
                    stage,
                    attempt,
                    failure.kind,
                    delay.as_millis(),
                    failure.message
                );
                Ok(AdvanceOutcome::RetryScheduled { job, retry_at })
            }
            RetryDecision::Requeue => {
                let counted = self.retry.counts_resource_exhaustion();
                let job = self.commit_step(
                    fresh,
                    |mut job| {
                        if counted {
                            job.attempts.increment(stage);
                        }
                        job.status = stage.waiting_status();
                        job.error_info = Some(info.clone());
                        with_rejection(job).audit(
                            NewAuditEntry::new(stage, AuditEvent::Requeued)
                                .with_detail(failure.message.clone()),
                        )
                    },
                    still_active,
                )?;
                metrics::STAGE_EXECUTIONS
                    .with_label_values(&[stage.as_str(), "requeued"])
                    .inc();
                metrics::REQUEUES.with_label_values(&[stage.as_str()]).inc();
                info!(
                    "Job {} requeued at {}: {}",
                    job.id, stage, failure.message
                );
                Ok(AdvanceOutcome::Requeued(job))
            }
            RetryDecision::Fail => {
                let job = self.commit_step(
                    fresh,
                    |mut job| {
                        job.attempts.increment(stage);
                        job.status = JobStatus::Failed;
                        job.retry_at = None;
                        job.error_info = Some(info.clone());
                        with_rejection(job).audit(
                            NewAuditEntry::new(stage, AuditEvent::Failed).with_detail(format!(
                                "attempt {} failed ({}): {}",
                                attempt, failure.kind, failure.message
                            )),
                        )
                    },
                    still_active,
                )?;
                metrics::STAGE_EXECUTIONS
                    .with_label_values(&[stage.as_str(), "failed"])
                    .inc();
                metrics::TERMINAL_JOBS.with_label_values(&["failed"]).inc();
                error!(
                    "Job {} failed at {} attempt {} ({}): {}",
                    job.id, stage, attempt, failure.kind, failure.message
                );
                Ok(AdvanceOutcome::Terminal(job))
            }
        }
    }

    fn interrupt(&self, fresh: Job) -> Result<Job, OrchestratorError> {
        let stage = fresh.stage;
        let active = fresh.status;
        let job = self.commit_step(
            fresh,
            |mut job| {
                job.status = stage.waiting_status();
                JobTransition::new(job).audit(
                    NewAuditEntry::new(stage, AuditEvent::Interrupted)
                        .with_detail("stopped by shutdown"),
                )
            },
            |job| job.status == active && job.stage == stage,
        )?;
        metrics::STAGE_EXECUTIONS
            .with_label_values(&[stage.as_str(), "interrupted"])
            .inc();
        Ok(job)
    }

    async fn discard_output(&self, dir: Option<PathBuf>) {
        let Some(dir) = dir else {
            return;
        };
        if !self.pipeline.is_under_work_dir(&dir) {
            warn!("Refusing to remove output outside the work dir: {:?}", dir);
            return;
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Discarded output {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard output {:?}: {}", dir, e),
        }
    }
}
