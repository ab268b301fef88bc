//! In-memory job store.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::job::{Job, JobStatus};
use super::store::{JobPage, JobStore};
use crate::{Error, Result};

type PendingKey = (Reverse<i32>, u64);

struct Entry {
    job: Job,
    acknowledged: bool,
    /// Position in `pending` while queued.
    pending_key: Option<PendingKey>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    pending: BTreeMap<PendingKey, String>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn push_pending(&mut self, id: &str, priority: i32) -> PendingKey {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, id.to_string());
        key
    }
}

/// Job store kept entirely in process memory.
///
/// Same contract as the SQLite store, lost on restart.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, mut job: Job) -> Result<String> {
        let id = {
            let mut inner = self.inner.lock();
            inner.ensure_open()?;

            let existing = if job.is_persisted() {
                inner
                    .jobs
                    .get(&job.id)
                    .map(|e| (e.job.clone(), e.pending_key))
            } else {
                job.id = uuid::Uuid::new_v4().to_string();
                None
            };

            match existing {
                Some((mut stored, old_key)) => {
                    if stored.status != JobStatus::Queued {
                        stored.mark_requeued()?;
                    }
                    stored.error_detail = None;
                    if let Some(old_key) = old_key {
                        inner.pending.remove(&old_key);
                    }
                    let key = inner.push_pending(&stored.id, stored.priority);
                    let id = stored.id.clone();
                    debug!(job_id = %id, priority = stored.priority, "Re-admitting job");
                    inner.jobs.insert(
                        id.clone(),
                        Entry {
                            job: stored,
                            acknowledged: false,
                            pending_key: Some(key),
                        },
                    );
                    id
                }
                None => {
                    job.status = JobStatus::Queued;
                    job.progress = 0.0;
                    job.error_detail = None;
                    job.created_at = Utc::now();
                    job.started_at = None;
                    job.completed_at = None;

                    let key = inner.push_pending(&job.id, job.priority);
                    let id = job.id.clone();
                    inner.jobs.insert(
                        id.clone(),
                        Entry {
                            job,
                            acknowledged: false,
                            pending_key: Some(key),
                        },
                    );
                    id
                }
            }
        };

        info!(job_id = %id, "Enqueued job");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        while let Some((_, id)) = inner.pending.pop_first() {
            let Some(entry) = inner.jobs.get_mut(&id) else {
                continue;
            };
            entry.pending_key = None;
            entry.job.mark_processing(Utc::now())?;
            debug!(job_id = %id, priority = entry.job.priority, "Dequeued job");
            return Ok(Some(entry.job.clone()));
        }

        Ok(None)
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;
        entry.acknowledged = true;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        inner
            .jobs
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let entry = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| Error::not_found("Job", &job.id))?;
        let stored = &entry.job;

        let rejected = stored.status.is_terminal()
            || (stored.status != job.status
                && (job.status == JobStatus::Queued
                    || !stored.status.can_transition_to(job.status)));
        if rejected {
            return Err(Error::invalid_transition(stored.status, job.status));
        }

        let mut updated = job.clone();
        updated.priority = stored.priority;
        updated.created_at = stored.created_at;
        updated.started_at = stored.started_at.or(job.started_at);
        updated.completed_at = stored.completed_at.or(job.completed_at);
        entry.job = updated;

        let stale_key = if job.status != JobStatus::Queued {
            entry.pending_key.take()
        } else {
            None
        };
        if let Some(key) = stale_key {
            inner.pending.remove(&key);
        }
        Ok(())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<JobPage> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let mut matching: Vec<&Job> = inner
            .jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| status.is_none_or(|s| j.status == s))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(JobPage { jobs, total })
    }

    async fn cancel_job(&self, id: &str) -> Result<Job> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;
        if entry.job.status.is_terminal() {
            debug!(job_id = %id, status = %entry.job.status, "Cancel on terminal job is a no-op");
            return Ok(entry.job.clone());
        }

        let was_queued = entry.job.status == JobStatus::Queued;
        entry.job.mark_cancelled(Utc::now())?;
        if was_queued {
            entry.acknowledged = true;
        }
        let job = entry.job.clone();
        if let Some(key) = entry.pending_key.take() {
            inner.pending.remove(&key);
        }

        info!(job_id = %id, was_queued, "Cancelled job");
        Ok(job)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.pending.len() as u64)
    }

    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let before = inner.jobs.len();
        inner.jobs.retain(|_, e| {
            !(e.acknowledged
                && e.job.status.is_terminal()
                && e.job.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            inner.pending.clear();
            inner.jobs.clear();
        }
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let store = MemoryJobStore::new();
        let a = store.enqueue(Job::new("a", "a").with_priority(5)).await.unwrap();
        let b = store.enqueue(Job::new("b", "b").with_priority(10)).await.unwrap();
        let c = store.enqueue(Job::new("c", "c").with_priority(5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.dequeue().await.unwrap() {
            assert_eq!(job.status, JobStatus::Processing);
            order.push(job.id);
        }
        assert_eq!(order, vec![b, a, c]);
    }

    #[tokio::test]
    async fn test_negative_priority_sorts_last() {
        let store = MemoryJobStore::new();
        let neg = store.enqueue(Job::new("n", "n").with_priority(-1)).await.unwrap();
        let zero = store.enqueue(Job::new("z", "z")).await.unwrap();

        assert_eq!(store.dequeue().await.unwrap().unwrap().id, zero);
        assert_eq!(store.dequeue().await.unwrap().unwrap().id, neg);
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let store = MemoryJobStore::new();
        let queued = store.enqueue(Job::new("a", "a")).await.unwrap();
        let running = store.enqueue(Job::new("b", "b")).await.unwrap();

        store.cancel_job(&queued).await.unwrap();
        assert_eq!(store.queue_depth().await.unwrap(), 1);

        let job = store.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, running);
        let cancelled = store.cancel_job(&running).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let again = store.cancel_job(&running).await.unwrap();
        assert_eq!(again, cancelled);
        assert!(store.cancel_job("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_rejects_regression_to_queued() {
        let store = MemoryJobStore::new();
        store.enqueue(Job::new("a", "a")).await.unwrap();
        let mut job = store.dequeue().await.unwrap().unwrap();

        job.status = JobStatus::Queued;
        assert!(matches!(
            store.update_job(&job).await.unwrap_err(),
            Error::InvalidStateTransition { .. }
        ));
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        store.cancel_job(&id).await.unwrap();

        assert_eq!(store.evict_expired(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.evict_expired(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.get_job(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = MemoryJobStore::new();
        for i in 0..7 {
            store.enqueue(Job::new(format!("{i}"), "o")).await.unwrap();
        }
        let page = store.list_jobs(None, 3, 6).await.unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.jobs.len(), 1);
    }
}
