#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use flixsrota::queue::{JobStatus, JobStore, SqliteJobStore};
use flixsrota::storage::StorageAdapter;
use flixsrota::transcode::{ExecutionOutcome, Executor, FailureReason, TranscodeRequest};

pub async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteJobStore> {
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display());
    Arc::new(SqliteJobStore::connect(&url).await.unwrap())
}

/// Records the inputs it was asked to transcode, in order.
#[derive(Default)]
pub struct RecordingExecutor {
    pub delay: Duration,
    pub inputs: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, request: &TranscodeRequest, cancel: CancellationToken) -> ExecutionOutcome {
        self.inputs.lock().push(request.input.clone());
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => ExecutionOutcome::Success { duration: self.delay },
            _ = cancel.cancelled() => ExecutionOutcome::Failure(FailureReason::Cancelled),
        }
    }

    async fn validate(&self) -> flixsrota::Result<()> {
        Ok(())
    }
}

pub struct PassthroughStorage;

#[async_trait]
impl StorageAdapter for PassthroughStorage {
    async fn resolve_input(&self, locator: &str) -> flixsrota::Result<PathBuf> {
        Ok(PathBuf::from(locator))
    }

    async fn prepare_output(&self, locator: &str, _variants: usize) -> flixsrota::Result<PathBuf> {
        Ok(PathBuf::from(locator))
    }

    fn temp_dir(&self) -> &Path {
        Path::new("/tmp")
    }
}

pub async fn wait_for_status(store: &dyn JobStore, id: &str, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
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
