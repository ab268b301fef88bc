//! Coordinator loop that hands queued jobs to idle workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::pool::{WorkerLease, WorkerPool};
use crate::Result;
use crate::config::DispatchStrategy;
use crate::queue::{Job, JobStore};

/// Snapshot of dispatcher activity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    /// Jobs returned to the queue because no worker was idle.
    pub requeued: u64,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
}

/// Owns the worker pool and the coordinator task.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    strategy: DispatchStrategy,
    tick: Duration,
    /// Cancellation tokens of jobs currently held by a worker.
    running: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    dispatched: AtomicU64,
    requeued: AtomicU64,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        strategy: DispatchStrategy,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            strategy,
            tick,
            running: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            coordinator: Mutex::new(None),
            dispatched: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        })
    }

    /// Spawn the coordinator. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut coordinator = self.coordinator.lock();
        if coordinator.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        info!(
            workers = self.pool.size(),
            strategy = %self.strategy,
            tick_ms = self.tick.as_millis() as u64,
            "Starting job processor"
        );

        let this = self.clone();
        *coordinator = Some(tokio::spawn(async move {
            match this.strategy {
                DispatchStrategy::WorkerFirst => this.run_worker_first().await,
                DispatchStrategy::Requeue => this.run_requeue().await,
            }
            debug!("Coordinator loop exited");
        }));
    }

    /// Stop dispatching and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        info!("Stopping job processor");
        self.shutdown.cancel();

        let handle = self.coordinator.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Coordinator task panicked: {}", e);
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Job processor stopped");
    }

    /// Cancel a job in the store and kill its process if a worker holds it.
    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        let job = self.store.cancel_job(id).await?;
        if let Some(token) = self.running.get(id) {
            info!(job_id = %id, "Signalling running job to stop");
            token.cancel();
        }
        Ok(job)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.lock().is_some() && !self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            idle_workers: self.pool.idle_count(),
            busy_workers: self.pool.busy_count(),
            total_workers: self.pool.size(),
        }
    }

    /// Reserve capacity, then wait for a job before taking a worker.
    async fn run_worker_first(&self) {
        let notify = self.store.notifier();

        'outer: loop {
            let reservation = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                reservation = self.pool.reserve() => match reservation {
                    Some(reservation) => reservation,
                    None => break,
                },
            };

            loop {
                match self.store.dequeue().await {
                    Ok(Some(job)) => {
                        match reservation.into_lease() {
                            Some(lease) => self.spawn_job(lease, job),
                            None => {
                                error!(job_id = %job.id, "Reserved worker missing; returning job to queue");
                                self.requeue(job).await;
                            }
                        }
                        continue 'outer;
                    }
                    Ok(None) => {}
                    Err(e) => self.log_dequeue_error(&e),
                }

                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'outer,
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(self.tick) => {}
                }
            }
        }
    }

    /// Dequeue on every wake-up; re-admit the job when no worker is idle.
    async fn run_requeue(&self) {
        let notify = self.store.notifier();
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backpressure = false;

        loop {
            // A requeue fires the notifier, so after backpressure only the
            // tick may wake us.
            if backpressure {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                }
            }
            backpressure = false;

            loop {
                if self.shutdown.is_cancelled() {
                    return;
                }

                let job = match self.store.dequeue().await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        self.log_dequeue_error(&e);
                        break;
                    }
                };

                match self.pool.try_acquire() {
                    Some(lease) => self.spawn_job(lease, job),
                    None => {
                        warn!(
                            job_id = %job.id,
                            priority = job.priority,
                            busy = self.pool.busy_count(),
                            "No idle worker, requeueing job"
                        );
                        self.requeue(job).await;
                        backpressure = true;
                        break;
                    }
                }
            }
        }
    }

    async fn requeue(&self, job: Job) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
        let job_id = job.id.clone();
        if let Err(e) = self.store.enqueue(job).await {
            error!(job_id = %job_id, error = %e, "Failed to requeue job");
        }
    }

    fn spawn_job(&self, lease: WorkerLease, job: Job) {
        let job_id = job.id.clone();
        let token = CancellationToken::new();
        self.running.insert(job_id.clone(), token.clone());
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        debug!(job_id = %job_id, worker = lease.worker().id(), "Dispatching job");

        let running = self.running.clone();
        self.tracker.spawn(async move {
            lease.worker().process_job(job, token).await;
            running.remove(&job_id);
            drop(lease);
        });
    }

    fn log_dequeue_error(&self, e: &crate::Error) {
        if e.is_retryable() {
            warn!(error = %e, "Dequeue failed, retrying next tick");
        } else {
            error!(error = %e, "Dequeue failed, retrying next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobStatus, MemoryJobStore};
    use crate::transcode::{ExecutionOutcome, Executor, FailureReason, TranscodeRequest};
    use crate::worker::runner::tests::PassthroughStorage;
    use crate::worker::{Worker, WorkerContext};
    use async_trait::async_trait;

    /// Sleeps for `delay` unless cancelled.
    struct SlowExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl Executor for SlowExecutor {
        async fn execute(&self, _: &TranscodeRequest, cancel: CancellationToken) -> ExecutionOutcome {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => ExecutionOutcome::Success { duration: self.delay },
                _ = cancel.cancelled() => ExecutionOutcome::Failure(FailureReason::Cancelled),
            }
        }

        async fn validate(&self) -> Result<()> {
            Ok(())
        }
    }

    fn processor(
        store: Arc<MemoryJobStore>,
        workers: usize,
        delay: Duration,
        strategy: DispatchStrategy,
    ) -> Arc<JobProcessor> {
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            executor: Arc::new(SlowExecutor { delay }),
            storage: Arc::new(PassthroughStorage),
            qualities: vec!["360p".to_string()],
        });
        let pool = WorkerPool::new(Worker::many(workers, ctx));
        JobProcessor::new(store, pool, strategy, Duration::from_millis(20))
    }

    async fn wait_for_status(store: &MemoryJobStore, id: &str, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get_job(id).await.unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"));
    }

    #[tokio::test]
    async fn test_worker_first_processes_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 2, Duration::from_millis(10), DispatchStrategy::WorkerFirst);
        processor.start();

        let a = store.enqueue(Job::new("a", "a")).await.unwrap();
        let b = store.enqueue(Job::new("b", "b")).await.unwrap();

        wait_for_status(&store, &a, JobStatus::Completed).await;
        wait_for_status(&store, &b, JobStatus::Completed).await;

        processor.stop().await;
        let stats = processor.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.idle_workers, 2);
    }

    #[tokio::test]
    async fn test_idle_worker_first_reports_no_busy_workers() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 2, Duration::from_millis(10), DispatchStrategy::WorkerFirst);
        processor.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = processor.stats();
        assert_eq!(stats.busy_workers, 0, "no job running: {stats:?}");
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.total_workers, 2);

        processor.stop().await;
    }

    #[tokio::test]
    async fn test_busy_count_tracks_running_job() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 2, Duration::from_secs(30), DispatchStrategy::WorkerFirst);
        processor.start();

        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        wait_for_status(&store, &id, JobStatus::Processing).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while processor.stats().busy_workers != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(processor.stats().idle_workers, 1);

        processor.cancel_job(&id).await.unwrap();
        processor.stop().await;
        assert_eq!(processor.stats().busy_workers, 0);
    }

    #[tokio::test]
    async fn test_requeue_under_backpressure_with_single_worker() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 1, Duration::from_millis(150), DispatchStrategy::Requeue);

        let first = store.enqueue(Job::new("a", "a").with_priority(10)).await.unwrap();
        let second = store.enqueue(Job::new("b", "b").with_priority(1)).await.unwrap();
        processor.start();

        wait_for_status(&store, &first, JobStatus::Completed).await;
        wait_for_status(&store, &second, JobStatus::Completed).await;
        processor.stop().await;

        let stats = processor.stats();
        assert!(stats.requeued >= 1, "expected at least one requeue, got {stats:?}");
        assert_eq!(stats.dispatched, 2);

        // The requeued job kept its priority and original admission time.
        let second = store.get_job(&second).await.unwrap();
        assert_eq!(second.priority, 1);
        assert!(second.started_at.unwrap() >= second.created_at);
    }

    #[tokio::test]
    async fn test_cancel_running_job_signals_worker() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 1, Duration::from_secs(30), DispatchStrategy::WorkerFirst);
        processor.start();

        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        wait_for_status(&store, &id, JobStatus::Processing).await;

        let job = processor.cancel_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The worker returns to the pool long before the executor's delay.
        tokio::time::timeout(Duration::from_secs(5), async {
            while processor.pool().idle_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        processor.stop().await;
        assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = processor(store.clone(), 1, Duration::from_millis(100), DispatchStrategy::WorkerFirst);
        processor.start();

        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        wait_for_status(&store, &id, JobStatus::Processing).await;

        processor.stop().await;
        assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Completed);
        assert!(!processor.is_running());
    }
}
