//! Priority job store contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::job::{Job, JobStatus};
use crate::Result;

/// One page of [`JobStore::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Number of jobs matching the filter, ignoring limit and offset.
    pub total: u64,
}

/// Durable, priority-ordered holding area for jobs.
///
/// Every job lives in an index keyed by id regardless of status. Queued jobs
/// additionally sit in a pending structure ordered by priority (higher first)
/// and then admission sequence (older first).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Admit a job and return its id.
    ///
    /// A job without an id gets a fresh UUID; its `created_at` is reset to now.
    /// Re-enqueueing a known, non-terminal id re-admits it at the back of its
    /// priority class with the stored priority and `created_at` kept.
    async fn enqueue(&self, job: Job) -> Result<String>;

    /// Remove the head of the pending structure and return it as `Processing`.
    ///
    /// `Ok(None)` means there is no queued work.
    async fn dequeue(&self) -> Result<Option<Job>>;

    /// Mark queue-side bookkeeping complete. Idempotent.
    async fn acknowledge(&self, id: &str) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Job>;

    /// Replace the stored record for `job.id`.
    ///
    /// `id`, `priority` and `created_at` are never overwritten. A record that
    /// is already terminal is not modified and the call fails with
    /// `InvalidStateTransition`, so the first terminal write wins. Moving a
    /// record back to `Queued` must go through [`JobStore::enqueue`].
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// List jobs newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: u32, offset: u32)
    -> Result<JobPage>;

    /// Cancel a job and return the resulting record.
    ///
    /// Already-terminal jobs are returned unchanged.
    async fn cancel_job(&self, id: &str) -> Result<Job>;

    /// Number of queued jobs.
    async fn queue_depth(&self) -> Result<u64>;

    /// Delete terminal, acknowledged jobs that completed before `cutoff`.
    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Release backend resources. Idempotent; later calls fail with `StoreClosed`.
    async fn close(&self);

    /// Notified once per successful enqueue.
    fn notifier(&self) -> Arc<Notify>;
}
