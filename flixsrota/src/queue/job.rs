//! Job record and lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Job status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the pending structure.
    Queued,
    /// Handed to a worker.
    Processing,
    /// ffmpeg exited successfully.
    Completed,
    /// Execution failed; see `error_detail`.
    Failed,
    /// Cancelled before completing.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a record in this status may move to `next`.
    ///
    /// `Processing -> Queued` is the re-admission path used by backpressure.
    /// `Processing -> Processing` lets a worker persist its own start.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Processing | Cancelled) => true,
            (Processing, Processing | Queued | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// A transcoding request and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID. Empty until the store assigns one on first enqueue.
    pub id: String,
    /// Source media locator, resolved by the storage adapter.
    pub input_locator: String,
    /// Variant playlist locator (may contain `%v`), resolved by the storage adapter.
    pub output_locator: String,
    /// Caller-supplied ffmpeg tokens appended after the synthesized arguments.
    #[serde(default)]
    pub requested_args: Vec<String>,
    /// Job priority (higher = more urgent).
    pub priority: i32,
    /// Current status.
    pub status: JobStatus,
    /// Progress percentage (0-100).
    pub progress: f64,
    /// Error message, only set when failed.
    pub error_detail: Option<String>,
    /// Opaque caller metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When the job was first admitted.
    pub created_at: DateTime<Utc>,
    /// When the job first entered processing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new, not yet persisted job.
    pub fn new(input_locator: impl Into<String>, output_locator: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            input_locator: input_locator.into(),
            output_locator: output_locator.into(),
            requested_args: Vec::new(),
            priority: 0,
            status: JobStatus::Queued,
            progress: 0.0,
            error_detail: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the caller override tokens.
    pub fn with_requested_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the store has assigned an ID.
    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Enter `Processing`: progress resets to 0 and `started_at` is set once.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Processing)?;
        self.progress = 0.0;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Return a dequeued job to `Queued`.
    ///
    /// The job never reached a worker, so `started_at` is cleared.
    pub fn mark_requeued(&mut self) -> Result<()> {
        self.transition(JobStatus::Queued)?;
        self.progress = 0.0;
        self.started_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.error_detail = None;
        self.completed_at.get_or_insert(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_detail = Some(error.into());
        self.completed_at.get_or_insert(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at.get_or_insert(now);
        Ok(())
    }

    /// Raise progress; values below the current one are ignored.
    pub fn set_progress(&mut self, progress: f64) {
        if self.status != JobStatus::Processing || !progress.is_finite() {
            return;
        }
        self.progress = self.progress.max(progress.clamp(0.0, 100.0));
    }

    /// Seconds spent waiting between admission and first start.
    pub fn queue_wait_secs(&self) -> Option<f64> {
        self.started_at
            .map(|started| ((started - self.created_at).num_milliseconds() as f64 / 1000.0).max(0.0))
    }
}
