// packages/engine/src/runtime/worker_pool.rs
//! Bounded pool of job slots
//!
//! Tools are heavyweight, so only `pool_size` jobs may run at once. Further
//! jobs wait for a slot (backpressure) instead of being rejected.
//!
//! ```text
//! WorkerPool
//! ├─ Semaphore(pool_size)   permits = free slots
//! ├─ busy                   slots currently held
//! └─ completed              slots released so far
//! ```
//!
//! A [`WorkerSlot`] is held by a job from workspace setup until teardown (or
//! reaper scheduling) and released on drop, on every exit path.

use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Pool of job slots
pub struct WorkerPool {
    pool_size: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    busy: AtomicUsize,
    completed: AtomicU64,
    next_slot: AtomicU64,
}

/// Exclusive right to run one job. Released on drop.
pub struct WorkerSlot {
    id: u64,
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.counters.busy.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        debug!("Released worker slot #{}", self.id);
    }
}

impl WorkerPool {
    pub fn new(pool_size: usize) -> Self {
        info!("Initializing worker pool with {} slots", pool_size);

        Self {
            pool_size,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolExhausted)?;

        Ok(self.slot(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| EngineError::PoolExhausted)?;

        Ok(self.slot(permit))
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> WorkerSlot {
        let id = self.counters.next_slot.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.busy.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired worker slot #{}", id);

        WorkerSlot {
            id,
            counters: Arc::clone(&self.counters),
            _permit: permit,
        }
    }

    /// Stop handing out slots. Waiters and later acquisitions fail with
    /// `PoolExhausted`; slots already held stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.pool_size,
            available_slots: self.semaphore.available_permits(),
            busy_slots: self.counters.busy.load(Ordering::SeqCst),
            completed_jobs: self.counters.completed.load(Ordering::SeqCst),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub available_slots: usize,
    pub busy_slots: usize,
    pub completed_jobs: u64,
}
