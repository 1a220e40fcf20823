//! Scheduler implementation.
//!
//! Workers pop jobs from the queue, lease them, take a slot from the pool
//! serving the job's stage, run one orchestrator step and queue the job
//! again according to the outcome.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus, JobStore, Lease, StoreError};
use crate::metrics;
use crate::orchestrator::{AdvanceOutcome, JobOrchestrator, OrchestratorError};

use super::config::SchedulerConfig;
use super::pool::{PoolKind, ResourcePools};
use super::queue::{JobQueue, QueuedJob};
use super::types::SchedulerStatus;

/// Jobs loaded per store scan.
const SCAN_BATCH: i64 = 1000;

/// How long `stop` waits for workers to finish their step.
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct WorkerStats {
    steps_run: AtomicU64,
    leases_busy: AtomicU64,
}

/// Bounded worker pool over the job queue.
pub struct Scheduler {
    config: SchedulerConfig,
    orchestrator: Arc<JobOrchestrator>,
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    pools: Arc<ResourcePools>,
    owner_prefix: String,

    // Runtime state
    running: Arc<AtomicBool>,
    executing: Arc<Mutex<HashSet<String>>>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a new scheduler around `orchestrator`.
    pub fn new(config: SchedulerConfig, orchestrator: Arc<JobOrchestrator>) -> Self {
        let owner_prefix = config.instance_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("worklist-{}", &id[..8])
        });

        Self {
            store: Arc::clone(orchestrator.store()),
            queue: Arc::new(JobQueue::new()),
            pools: Arc::new(ResourcePools::new(
                config.accelerator_slots,
                config.general_slots,
            )),
            config,
            orchestrator,
            owner_prefix,
            running: Arc::new(AtomicBool::new(false)),
            executing: Arc::new(Mutex::new(HashSet::new())),
            stats: Arc::new(WorkerStats::default()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Puts a job in the queue. Terminal jobs are ignored.
    pub fn admit(&self, job: &Job) -> bool {
        if job.is_terminal() {
            return false;
        }
        self.queue.push(QueuedJob::from_job(job))
    }

    /// Reacts to a freshly set cancel flag.
    ///
    /// A stage running in this process is signalled directly; otherwise the
    /// job is queued so a worker records the cancellation.
    pub fn notify_cancel(&self, job: &Job) {
        if self.orchestrator.cancel_in_flight(&job.id) {
            debug!("Signalled running stage of job {} to abort", job.id);
        } else {
            self.admit(job);
        }
    }

    /// Start the poll loop and the workers.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() {
            warn!("Scheduler was stopped and cannot be restarted");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!(
            "Starting scheduler: {} workers, {} accelerator slots, {} general slots",
            self.config.workers, self.config.accelerator_slots, self.config.general_slots
        );

        // Recover jobs left unfinished by a previous run
        let recovered = enqueue_runnable(self.store.as_ref(), &self.queue, &self.executing);
        if recovered > 0 {
            info!("Queued {} unfinished jobs", recovered);
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(self.spawn_poll_loop());
        for index in 0..self.config.workers {
            tasks.push(self.spawn_worker(index));
        }

        info!("Scheduler started");
    }

    /// Stop the workers. Running stages are interrupted and their jobs return
    /// to rest for the next start.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping scheduler");
        self.shutdown.cancel();
        self.orchestrator.shutdown();

        let tasks: Vec<_> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if tokio::time::timeout(STOP_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("Workers did not stop within {:?}", STOP_GRACE);
        }

        info!("Scheduler stopped");
    }

    /// Get current scheduler status.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::Relaxed),
            workers: self.config.workers,
            queue: self.queue.status(),
            executing: self
                .executing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            in_flight_stages: self.orchestrator.in_flight_count(),
            pools: self.pools.status(),
            steps_run: self.stats.steps_run.load(Ordering::Relaxed),
            leases_busy: self.stats.leases_busy.load(Ordering::Relaxed),
        }
    }

    fn worker(&self, index: usize) -> Worker {
        Worker {
            owner: format!("{}-{}", self.owner_prefix, index),
            config: self.config.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            pools: Arc::clone(&self.pools),
            executing: Arc::clone(&self.executing),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        }
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let worker = self.worker(index);
        tokio::spawn(worker.run())
    }

    /// Spawn the store scan loop.
    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        let executing = Arc::clone(&self.executing);
        let interval = self.config.poll_interval();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("Poll loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Poll loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let queued = enqueue_runnable(store.as_ref(), &queue, &executing);
                        if queued > 0 {
                            debug!("Poll queued {} jobs", queued);
                        }
                    }
                }
            }
            info!("Poll loop stopped");
        })
    }
}

/// Queues every runnable job that is neither queued nor being stepped.
fn enqueue_runnable(
    store: &dyn JobStore,
    queue: &JobQueue,
    executing: &Mutex<HashSet<String>>,
) -> usize {
    let jobs = match store.runnable(SCAN_BATCH) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!("Failed to scan for runnable jobs: {}", e);
            return 0;
        }
    };

    let now = Utc::now();
    let executing = executing.lock().unwrap_or_else(|e| e.into_inner());
    let mut queued = 0;

    for job in jobs {
        if executing.contains(&job.id) || queue.contains(&job.id) {
            continue;
        }
        let entry = QueuedJob::from_job(&job);
        let added = match job.retry_at {
            Some(at) if job.status == JobStatus::Retrying && at > now => {
                queue.push_after(entry, (at - now).to_std().unwrap_or_default())
            }
            _ => queue.push(entry),
        };
        if added {
            queued += 1;
        }
    }

    queued
}

/// One worker task.
#[derive(Clone)]
struct Worker {
    owner: String,
    config: SchedulerConfig,
    orchestrator: Arc<JobOrchestrator>,
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    pools: Arc<ResourcePools>,
    executing: Arc<Mutex<HashSet<String>>>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!("Worker {} started", self.owner);
        while let Some(next) = self.queue.pop(&self.shutdown).await {
            let job_id = next.job_id.clone();
            self.set_executing(&job_id, true);
            self.step(next).await;
            self.set_executing(&job_id, false);
        }
        debug!("Worker {} stopped", self.owner);
    }

    fn set_executing(&self, job_id: &str, executing: bool) {
        let mut set = self.executing.lock().unwrap_or_else(|e| e.into_inner());
        if executing {
            set.insert(job_id.to_string());
        } else {
            set.remove(job_id);
        }
    }

    async fn step(&self, next: QueuedJob) {
        let lease = match self
            .store
            .acquire_lease(&next.job_id, &self.owner, self.config.lease_ttl())
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                metrics::LEASES_BUSY.inc();
                self.stats.leases_busy.fetch_add(1, Ordering::Relaxed);
                debug!("Job {} is leased by another worker, skipping", next.job_id);
                return;
            }
            Err(StoreError::NotFound(_)) => {
                warn!("Queued job {} no longer exists", next.job_id);
                return;
            }
            Err(e) => {
                warn!("Failed to lease job {}: {}", next.job_id, e);
                self.queue.push_after(next, self.config.requeue_delay());
                return;
            }
        };

        let outcome = self.step_leased(&lease).await;

        if let Err(e) = self.store.release_lease(&lease) {
            warn!("Failed to release lease on job {}: {}", lease.job_id, e);
        }
        self.stats.steps_run.fetch_add(1, Ordering::Relaxed);

        if let Some(outcome) = outcome {
            self.requeue(next, outcome);
        }
    }

    /// Runs one step of a leased job. `None` when there is nothing to requeue.
    async fn step_leased(
        &self,
        lease: &Lease,
    ) -> Option<Result<AdvanceOutcome, OrchestratorError>> {
        let job = match self.store.get(&lease.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => return Some(Err(e.into())),
        };
        if job.is_terminal() {
            return None;
        }

        // Cancellation needs no execution slot
        if job.cancel_requested {
            return Some(self.advance_leased(lease).await);
        }

        if job.status == JobStatus::Retrying {
            if let Some(until) = job.retry_at.filter(|at| *at > Utc::now()) {
                return Some(Ok(AdvanceOutcome::NotReady { until }));
            }
        }

        let wait = self.config.slot_wait();
        let slot = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            slot = self.pools.acquire(job.stage, wait) => slot,
        };
        let Some(slot) = slot else {
            debug!(
                "No {} slot for job {} within {:?}",
                PoolKind::for_stage(job.stage).as_str(),
                job.id,
                wait
            );
            return Some(self.orchestrator.requeue_for_resources(&job.id, wait));
        };

        let outcome = self.advance_leased(lease).await;
        drop(slot);
        Some(outcome)
    }

    /// Runs `advance` while renewing the lease.
    async fn advance_leased(&self, lease: &Lease) -> Result<AdvanceOutcome, OrchestratorError> {
        let advance = self.orchestrator.advance(&lease.job_id);
        tokio::pin!(advance);

        let ttl = self.config.lease_ttl();
        let mut held = lease.clone();
        let mut renewal = tokio::time::interval(self.config.lease_renewal());
        renewal.tick().await;

        loop {
            tokio::select! {
                outcome = &mut advance => return outcome,
                _ = renewal.tick() => match self.store.renew_lease(&held, ttl) {
                    Ok(renewed) => held = renewed,
                    Err(e) => warn!("Failed to renew lease on job {}: {}", held.job_id, e),
                },
            }
        }
    }

    fn requeue(&self, next: QueuedJob, outcome: Result<AdvanceOutcome, OrchestratorError>) {
        match outcome {
            Ok(AdvanceOutcome::Terminal(job)) => {
                debug!("Job {} finished as {}", job.id, job.status);
            }
            Ok(AdvanceOutcome::Advanced(_)) => {
                self.queue.push(next);
            }
            Ok(AdvanceOutcome::RetryScheduled { retry_at, .. })
            | Ok(AdvanceOutcome::NotReady { until: retry_at }) => {
                let delay = (retry_at - Utc::now()).to_std().unwrap_or_default();
                self.queue.push_after(next, delay);
            }
            Ok(AdvanceOutcome::Requeued(_)) => {
                self.queue.push_after(next, self.config.requeue_delay());
            }
            Ok(AdvanceOutcome::Interrupted(job)) => {
                debug!("Job {} interrupted at {}, left for the next start", job.id, job.status);
            }
            Err(OrchestratorError::JobNotFound(id)) => {
                warn!("Job {} disappeared while queued", id);
            }
            Err(OrchestratorError::Conflict(id)) => {
                debug!("Job {} changed during its step, requeueing", id);
                self.queue.push_after(next, self.config.requeue_delay());
            }
            Err(e) => {
                error!("Step failed for job {}: {}", next.job_id, e);
                self.queue.push_after(next, self.config.requeue_delay());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, NewJob, SqliteJobStore};
    use crate::orchestrator::PipelineConfig;
    use crate::retry::{RetryConfig, RetryManager};
    use crate::testing::{mock_adapter_set, MockAdapter};
    use crate::validation::{ValidationConfig, ValidationGate};

    fn scheduler(dir: &std::path::Path, store: Arc<SqliteJobStore>) -> Scheduler {
        let orchestrator = JobOrchestrator::new(
            store,
            mock_adapter_set(&MockAdapter::for_all_stages()),
            ValidationGate::new(ValidationConfig::default()),
            RetryManager::new(RetryConfig::default()),
            PipelineConfig {
                dicom_root: dir.join("dicom"),
                work_dir: dir.join("work"),
            },
        );
        let config = SchedulerConfig {
            workers: 2,
            poll_interval_ms: 50,
            instance_id: Some("test".to_string()),
            ..Default::default()
        };
        Scheduler::new(config, Arc::new(orchestrator))
    }

    #[tokio::test]
    async fn test_admit_ignores_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let scheduler = scheduler(dir.path(), store.clone());

        let mut job = store
            .create(NewJob::new("1.2.3", JobOptions::default()))
            .unwrap();
        assert!(scheduler.admit(&job));
        assert!(!scheduler.admit(&job));

        job.status = JobStatus::Failed;
        scheduler.queue().remove(&job.id);
        assert!(!scheduler.admit(&job));
        assert!(scheduler.queue().is_empty());
    }

    #[tokio::test]
    async fn test_start_recovers_and_completes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let job = store
            .create(NewJob::new("1.2.3", JobOptions::default()))
            .unwrap();

        let scheduler = scheduler(dir.path(), store.clone());
        scheduler.start();

        let mut status = JobStatus::Received;
        for _ in 0..100 {
            status = store.get(&job.id).unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, JobStatus::Complete);

        let snapshot = scheduler.status();
        assert!(snapshot.running);
        assert!(snapshot.steps_run >= 4);
        assert_eq!(snapshot.pools[0].in_use, 0);

        scheduler.stop().await;
        assert!(!scheduler.status().running);
    }
}
