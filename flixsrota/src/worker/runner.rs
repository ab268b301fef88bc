//! A single worker: runs one job from `Processing` to a terminal status.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::queue::{Job, JobStatus, JobStore};
use crate::storage::StorageAdapter;
use crate::transcode::command::AUDIO_BITRATES;
use crate::transcode::{
    ExecutionOutcome, Executor, FailureReason, TranscodeRequest, resolve_tiers,
};

/// Job metadata key that overrides the configured quality tiers
/// (comma-separated names).
pub const QUALITIES_METADATA_KEY: &str = "qualities";

/// Collaborators shared by every worker.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn Executor>,
    pub storage: Arc<dyn StorageAdapter>,
    /// Default enabled tiers.
    pub qualities: Vec<String>,
}

/// One worker. Cheap to clone; clones share the context.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    /// Build `count` workers sharing `ctx`.
    pub fn many(count: usize, ctx: Arc<WorkerContext>) -> Vec<Self> {
        (0..count).map(|id| Self::new(id, ctx.clone())).collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run `job` through the executor and record the result.
    ///
    /// Persistence failures are logged and never propagate. Returns the
    /// status this worker tried to write.
    pub async fn process_job(&self, mut job: Job, cancel: CancellationToken) -> JobStatus {
        let store = &self.ctx.store;
        let job_id = job.id.clone();

        if let Err(e) = job.mark_processing(Utc::now()) {
            warn!(worker = self.id, job_id = %job_id, error = %e, "Job is not runnable");
            self.acknowledge(&job_id).await;
            return job.status;
        }

        match store.update_job(&job).await {
            Ok(()) => {}
            Err(Error::InvalidStateTransition { from, .. }) => {
                // Cancelled between dequeue and pickup.
                info!(worker = self.id, job_id = %job_id, status = %from, "Job finished before it started");
                self.acknowledge(&job_id).await;
                return from.parse().unwrap_or(job.status);
            }
            Err(e) => {
                warn!(worker = self.id, job_id = %job_id, error = %e, "Failed to persist processing state");
            }
        }

        info!(
            worker = self.id,
            job_id = %job_id,
            priority = job.priority,
            queue_wait_secs = job.queue_wait_secs().unwrap_or_default(),
            "Processing job"
        );

        let outcome = if cancel.is_cancelled() {
            ExecutionOutcome::Failure(FailureReason::Cancelled)
        } else {
            match self.prepare(&job).await {
                Ok(request) => self.ctx.executor.execute(&request, cancel).await,
                Err(e) => {
                    warn!(worker = self.id, job_id = %job_id, error = %e, "Failed to prepare job");
                    self.finish(&mut job, |job| job.mark_failed(Utc::now(), format!("storage: {}", e)))
                        .await;
                    return JobStatus::Failed;
                }
            }
        };

        match outcome {
            ExecutionOutcome::Success { duration } => {
                info!(
                    worker = self.id,
                    job_id = %job_id,
                    duration_secs = duration.as_secs_f64(),
                    "Job completed"
                );
                self.finish(&mut job, |job| job.mark_completed(Utc::now()))
                    .await;
                JobStatus::Completed
            }
            ExecutionOutcome::Failure(FailureReason::Cancelled) => {
                info!(worker = self.id, job_id = %job_id, "Job cancelled while running");
                self.finish(&mut job, |job| job.mark_cancelled(Utc::now()))
                    .await;
                JobStatus::Cancelled
            }
            ExecutionOutcome::Failure(reason) => {
                warn!(worker = self.id, job_id = %job_id, reason = %reason, "Job failed");
                self.finish(&mut job, |job| job.mark_failed(Utc::now(), reason.to_string()))
                    .await;
                JobStatus::Failed
            }
        }
    }

    async fn prepare(&self, job: &Job) -> crate::Result<TranscodeRequest> {
        let resolved = match job.metadata.get(QUALITIES_METADATA_KEY) {
            Some(list) => resolve_tiers(list.split(',')),
            None => resolve_tiers(&self.ctx.qualities),
        };
        if !resolved.unknown.is_empty() {
            warn!(
                job_id = %job.id,
                unknown = ?resolved.unknown,
                "Skipping unknown quality tiers"
            );
        }
        if resolved.tiers.is_empty() {
            warn!(job_id = %job.id, "No video tiers enabled; output will be audio only");
        }

        let variants = if resolved.tiers.is_empty() {
            AUDIO_BITRATES.len()
        } else {
            resolved.tiers.len()
        };

        let input = self.ctx.storage.resolve_input(&job.input_locator).await?;
        let output = self
            .ctx
            .storage
            .prepare_output(&job.output_locator, variants)
            .await?;

        Ok(TranscodeRequest {
            job_id: job.id.clone(),
            input: input.to_string_lossy().into_owned(),
            output: output.to_string_lossy().into_owned(),
            tiers: resolved.tiers,
            overrides: job.requested_args.clone(),
        })
    }

    /// Apply a terminal transition, persist it, then acknowledge.
    async fn finish<F>(&self, job: &mut Job, transition: F)
    where
        F: FnOnce(&mut Job) -> crate::Result<()>,
    {
        if let Err(e) = transition(job) {
            error!(worker = self.id, job_id = %job.id, error = %e, "Invalid terminal transition");
        } else {
            match self.ctx.store.update_job(job).await {
                Ok(()) => {}
                Err(Error::InvalidStateTransition { from, .. }) => {
                    debug!(
                        worker = self.id,
                        job_id = %job.id,
                        stored = %from,
                        "Job already terminal; keeping stored status"
                    );
                }
                Err(e) => {
                    error!(
                        worker = self.id,
                        job_id = %job.id,
                        error = %e,
                        "Failed to persist terminal status; job may remain processing"
                    );
                }
            }
        }
        self.acknowledge(&job.id).await;
    }

    async fn acknowledge(&self, job_id: &str) {
        if let Err(e) = self.ctx.store.acknowledge(job_id).await {
            warn!(worker = self.id, job_id = %job_id, error = %e, "Failed to acknowledge job");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::MemoryJobStore;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    /// Executor that returns a fixed outcome and records requests.
    pub(crate) struct StubExecutor {
        pub outcome: ExecutionOutcome,
        pub seen: Mutex<Vec<TranscodeRequest>>,
    }

    impl StubExecutor {
        pub(crate) fn succeeding() -> Self {
            Self {
                outcome: ExecutionOutcome::Success {
                    duration: std::time::Duration::from_millis(1),
                },
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(
            &self,
            request: &TranscodeRequest,
            _cancel: CancellationToken,
        ) -> ExecutionOutcome {
            self.seen.lock().push(request.clone());
            self.outcome.clone()
        }

        async fn validate(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Storage that resolves every locator without touching the filesystem.
    pub(crate) struct PassthroughStorage;

    #[async_trait]
    impl StorageAdapter for PassthroughStorage {
        async fn resolve_input(&self, locator: &str) -> crate::Result<PathBuf> {
            Ok(PathBuf::from(locator))
        }

        async fn prepare_output(&self, locator: &str, _variants: usize) -> crate::Result<PathBuf> {
            Ok(PathBuf::from(locator))
        }

        fn temp_dir(&self) -> &Path {
            Path::new("/tmp")
        }
    }

    pub(crate) fn test_worker(id: usize) -> Worker {
        Worker::new(
            id,
            Arc::new(WorkerContext {
                store: Arc::new(MemoryJobStore::new()),
                executor: Arc::new(StubExecutor::succeeding()),
                storage: Arc::new(PassthroughStorage),
                qualities: vec!["360p".to_string()],
            }),
        )
    }

    fn worker_with(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn Executor>,
        storage: Arc<dyn StorageAdapter>,
    ) -> Worker {
        Worker::new(
            0,
            Arc::new(WorkerContext {
                store,
                executor,
                storage,
                qualities: vec!["720p".to_string(), "360p".to_string(), "999p".to_string()],
            }),
        )
    }

    #[tokio::test]
    async fn test_success_marks_completed_and_acknowledges() {
        let store = Arc::new(MemoryJobStore::new());
        let executor = Arc::new(StubExecutor::succeeding());
        let worker = worker_with(store.clone(), executor.clone(), Arc::new(PassthroughStorage));

        let id = store
            .enqueue(Job::new("in.mp4", "out/v%v/index.m3u8").with_requested_args(["-preset", "fast"]))
            .await
            .unwrap();
        let job = store.dequeue().await.unwrap().unwrap();

        let status = worker.process_job(job, CancellationToken::new()).await;
        assert_eq!(status, JobStatus::Completed);

        let stored = store.get_job(&id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100.0);
        assert!(stored.completed_at.is_some());

        let seen = executor.seen.lock();
        let names: Vec<_> = seen[0].tiers.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["360p", "720p"]);
        assert_eq!(seen[0].overrides, vec!["-preset", "fast"]);
    }

    #[tokio::test]
    async fn test_failure_records_error_detail() {
        let store = Arc::new(MemoryJobStore::new());
        let executor = Arc::new(StubExecutor {
            outcome: ExecutionOutcome::Failure(FailureReason::Exit {
                program: "ffmpeg".to_string(),
                code: Some(1),
                stderr: "moov atom not found".to_string(),
            }),
            seen: Mutex::new(Vec::new()),
        });
        let worker = worker_with(store.clone(), executor, Arc::new(PassthroughStorage));

        let id = store.enqueue(Job::new("in", "out")).await.unwrap();
        let job = store.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process_job(job, CancellationToken::new()).await, JobStatus::Failed);

        let stored = store.get_job(&id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_detail.as_deref(),
            Some("ffmpeg exited with code 1: moov atom not found")
        );
    }

    #[tokio::test]
    async fn test_metadata_overrides_tiers() {
        let store = Arc::new(MemoryJobStore::new());
        let executor = Arc::new(StubExecutor::succeeding());
        let worker = worker_with(store.clone(), executor.clone(), Arc::new(PassthroughStorage));

        store
            .enqueue(Job::new("in", "out").with_metadata(QUALITIES_METADATA_KEY, "1080p,480p"))
            .await
            .unwrap();
        let job = store.dequeue().await.unwrap().unwrap();
        worker.process_job(job, CancellationToken::new()).await;

        let seen = executor.seen.lock();
        let names: Vec<_> = seen[0].tiers.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["480p", "1080p"]);
    }

    #[tokio::test]
    async fn test_missing_input_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("media"), dir.path().join("tmp"))
            .await
            .unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let executor = Arc::new(StubExecutor::succeeding());
        let worker = worker_with(store.clone(), executor.clone(), Arc::new(storage));

        let id = store.enqueue(Job::new("missing.mp4", "out")).await.unwrap();
        let job = store.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process_job(job, CancellationToken::new()).await, JobStatus::Failed);

        let stored = store.get_job(&id).await.unwrap();
        assert!(stored.error_detail.unwrap().starts_with("storage: "));
        assert!(executor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_job_cancelled_before_pickup_is_not_run() {
        let store = Arc::new(MemoryJobStore::new());
        let executor = Arc::new(StubExecutor::succeeding());
        let worker = worker_with(store.clone(), executor.clone(), Arc::new(PassthroughStorage));

        let id = store.enqueue(Job::new("in", "out")).await.unwrap();
        let job = store.dequeue().await.unwrap().unwrap();
        store.cancel_job(&id).await.unwrap();

        worker.process_job(job, CancellationToken::new()).await;
        assert!(executor.seen.lock().is_empty());
        assert_eq!(store.get_job(&id).await.unwrap().status, JobStatus::Cancelled);
    }
}
