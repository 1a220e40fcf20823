//! Priority queue of jobs waiting for a worker.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// Longest a waiting worker sleeps without a wakeup.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// A job as the queue sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: String,
    /// Higher runs first.
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            priority: job.options.priority,
            submitted_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    job: QueuedJob,
    seq: u64,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority, then earlier submission, then earlier push
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.job.submitted_at.cmp(&self.job.submitted_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    not_before: Instant,
    entry: ReadyEntry,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.not_before
            .cmp(&other.not_before)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    seq: u64,
    ready: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    /// Live entry per job. Heap entries with another sequence are stale.
    queued: HashMap<String, Slot>,
    next_seq: u64,
}

impl QueueState {
    fn is_live(&self, entry: &ReadyEntry) -> bool {
        self.queued
            .get(&entry.job.job_id)
            .is_some_and(|slot| slot.seq == entry.seq)
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.not_before > now {
                break;
            }
            let Some(Reverse(due)) = self.delayed.pop() else {
                break;
            };
            if self.is_live(&due.entry) {
                if let Some(slot) = self.queued.get_mut(&due.entry.job.job_id) {
                    slot.ready = true;
                }
                self.ready.push(due.entry);
            }
        }
    }

    fn pop_ready(&mut self) -> Option<QueuedJob> {
        while let Some(entry) = self.ready.pop() {
            if self.is_live(&entry) {
                self.queued.remove(&entry.job.job_id);
                return Some(entry.job);
            }
        }
        None
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(head)| head.not_before)
    }
}

/// Snapshot of queue sizes.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub ready: usize,
    pub delayed: usize,
}

/// Jobs waiting to run, at most one entry per job.
///
/// Ready jobs are ordered by priority (highest first), then submission time,
/// then insertion order. Delayed jobs become ready at their `not_before`.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the job ready now. A pending delayed entry is superseded.
    ///
    /// Returns `false` if the job was already ready.
    pub fn push(&self, job: QueuedJob) -> bool {
        let mut state = self.lock();
        if state.queued.get(&job.job_id).is_some_and(|slot| slot.ready) {
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .queued
            .insert(job.job_id.clone(), Slot { seq, ready: true });
        state.ready.push(ReadyEntry { job, seq });
        drop(state);

        self.notify.notify_waiters();
        true
    }

    /// Makes the job ready after `delay`.
    ///
    /// Returns `false` if the job is already queued, ready or delayed.
    pub fn push_after(&self, job: QueuedJob, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.push(job);
        }

        let mut state = self.lock();
        if state.queued.contains_key(&job.job_id) {
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .queued
            .insert(job.job_id.clone(), Slot { seq, ready: false });
        state.delayed.push(Reverse(DelayedEntry {
            not_before: Instant::now() + delay,
            entry: ReadyEntry { job, seq },
        }));
        drop(state);

        // Waiters recompute their sleep deadline
        self.notify.notify_waiters();
        true
    }

    /// Takes the next ready job without waiting.
    pub fn try_pop(&self) -> Option<QueuedJob> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        state.pop_ready()
    }

    /// Waits for the next ready job. Returns `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(job) = state.pop_ready() {
                    return Some(job);
                }
                state.next_due()
            };
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().queued.contains_key(job_id)
    }

    /// Drops the job's entry, if any.
    pub fn remove(&self, job_id: &str) -> bool {
        self.lock().queued.remove(job_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        let ready = state.queued.values().filter(|slot| slot.ready).count();
        QueueStatus {
            ready,
            delayed: state.queued.len() - ready,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
