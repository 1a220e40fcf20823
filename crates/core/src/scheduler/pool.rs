//! Execution slot pools.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::job::Stage;
use crate::metrics;

/// Which pool a stage draws its slot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Exclusive accelerator slots, inference only.
    Accelerator,
    /// Everything else.
    General,
}

impl PoolKind {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Infer => PoolKind::Accelerator,
            Stage::Preprocess | Stage::Postprocess | Stage::Store => PoolKind::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Accelerator => "accelerator",
            PoolKind::General => "general",
        }
    }
}

/// Tracks statistics for a slot pool.
#[derive(Debug, Default)]
struct PoolStats {
    active: AtomicU64,
    waiting: AtomicU64,
    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
}

/// Status of one slot pool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub capacity: usize,
    /// Slots currently held.
    pub in_use: usize,
    /// Workers waiting for a slot.
    pub waiting: usize,
    pub total_acquired: u64,
    /// Waits that gave up after the slot wait limit.
    pub total_timeouts: u64,
}

#[derive(Debug)]
struct SlotPool {
    kind: PoolKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl SlotPool {
    fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    async fn acquire(&self, wait: Duration) -> Option<SlotGuard> {
        self.stats.waiting.fetch_add(1, Ordering::Relaxed);
        let acquired =
            tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned()).await;
        self.stats.waiting.fetch_sub(1, Ordering::Relaxed);

        match acquired {
            Ok(Ok(permit)) => {
                self.stats.active.fetch_add(1, Ordering::Relaxed);
                self.stats.total_acquired.fetch_add(1, Ordering::Relaxed);
                metrics::SLOTS_IN_USE
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
                Some(SlotGuard {
                    kind: self.kind,
                    stats: Arc::clone(&self.stats),
                    _permit: permit,
                })
            }
            // Closed semaphores never happen; treat like a timeout
            Ok(Err(_)) | Err(_) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::SLOT_WAIT_TIMEOUTS
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
                None
            }
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.kind.as_str().to_string(),
            capacity: self.capacity,
            in_use: self.stats.active.load(Ordering::Relaxed) as usize,
            waiting: self.stats.waiting.load(Ordering::Relaxed) as usize,
            total_acquired: self.stats.total_acquired.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A held execution slot. Released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    kind: PoolKind,
    stats: Arc<PoolStats>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        metrics::SLOTS_IN_USE
            .with_label_values(&[self.kind.as_str()])
            .dec();
    }
}

/// Accelerator and general slot pools.
#[derive(Debug)]
pub struct ResourcePools {
    accelerator: SlotPool,
    general: SlotPool,
}

impl ResourcePools {
    pub fn new(accelerator_slots: usize, general_slots: usize) -> Self {
        Self {
            accelerator: SlotPool::new(PoolKind::Accelerator, accelerator_slots),
            general: SlotPool::new(PoolKind::General, general_slots),
        }
    }

    /// Waits up to `wait` for a slot of the pool serving `stage`.
    pub async fn acquire(&self, stage: Stage, wait: Duration) -> Option<SlotGuard> {
        self.pool(PoolKind::for_stage(stage)).acquire(wait).await
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        vec![self.accelerator.status(), self.general.status()]
    }

    pub fn in_use(&self, kind: PoolKind) -> usize {
        self.pool(kind).stats.active.load(Ordering::Relaxed) as usize
    }

    fn pool(&self, kind: PoolKind) -> &SlotPool {
        match kind {
            PoolKind::Accelerator => &self.accelerator,
            PoolKind::General => &self.general,
        }
    }
}
