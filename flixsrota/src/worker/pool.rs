//! Fixed-size pool of workers.
//!
//! The pool owns its workers. A counting semaphore with one permit per
//! worker gates access. A [`WorkerReservation`] holds only a permit, so the
//! coordinator can wait for capacity without marking anyone busy; turning it
//! into a [`WorkerLease`] takes a worker off the idle stack. Dropping the
//! lease puts the worker back before the permit is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::runner::Worker;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
    /// Outstanding leases.
    busy: AtomicUsize,
    size: usize,
}

impl WorkerPool {
    /// Create a pool holding exactly `workers`.
    pub fn new(workers: Vec<Worker>) -> Arc<Self> {
        let size = workers.len();
        // Pop from the back: reverse so worker 0 is handed out first.
        let mut idle = workers;
        idle.reverse();
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(idle),
            busy: AtomicUsize::new(0),
            size,
        })
    }

    /// Take an idle worker without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.lease(permit)
    }

    /// Wait for an idle worker. `None` once the pool is closed.
    pub async fn acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        self.reserve().await?.into_lease()
    }

    /// Wait until a worker is free without taking it. `None` once closed.
    pub async fn reserve(self: &Arc<Self>) -> Option<WorkerReservation> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(WorkerReservation {
            pool: self.clone(),
            permit,
        })
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<WorkerLease> {
        // A permit always has a matching idle worker; see WorkerLease::drop.
        let worker = self.idle.lock().pop()?;
        self.busy.fetch_add(1, Ordering::AcqRel);
        Some(WorkerLease {
            worker,
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Stop handing out workers. Pending `acquire` calls return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not running a job. Reservations do not count as busy.
    pub fn idle_count(&self) -> usize {
        self.size.saturating_sub(self.busy_count())
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }
}

/// Capacity for one worker, held while waiting for a job.
pub struct WorkerReservation {
    pool: Arc<WorkerPool>,
    permit: OwnedSemaphorePermit,
}

impl WorkerReservation {
    /// Take the reserved worker off the idle stack.
    pub fn into_lease(self) -> Option<WorkerLease> {
        self.pool.lease(self.permit)
    }
}

/// Exclusive use of one worker.
pub struct WorkerLease {
    worker: Worker,
    pool: Arc<WorkerPool>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.idle.lock().push(self.worker.clone());
        self.pool.busy.fetch_sub(1, Ordering::AcqRel);
        // `_permit` is dropped after this body runs.
    }
}
