//! Request and response bodies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{Job, JobStatus};

/// Largest page `GET /api/jobs` returns.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub input_path: String,
    pub output_path: String,
    /// Extra ffmpeg options, whitespace separated.
    #[serde(default)]
    pub ffmpeg_args: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateJobRequest {
    pub fn into_job(self) -> Job {
        let args: Vec<String> = self
            .ffmpeg_args
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut job = Job::new(self.input_path, self.output_path)
            .with_priority(self.priority)
            .with_requested_args(args);
        job.metadata = self.metadata;
        job
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    /// Number of items to return (default: 20, max: 100)
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub input_path: String,
    pub output_path: String,
    pub ffmpeg_args: Vec<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            input_path: job.input_locator,
            output_path: job.output_locator,
            ffmpeg_args: job.requested_args,
            priority: job.priority,
            status: job.status,
            progress: job.progress,
            error: job.error_detail,
            metadata: job.metadata,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue_depth: u64,
    pub workers: WorkerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
    pub dispatched: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilterResponse {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_splits_args() {
        let request: CreateJobRequest = serde_json::from_str(
            r#"{"input_path":"a.mp4","output_path":"out","ffmpeg_args":"  -preset   fast -crf 20 ","priority":3}"#,
        )
        .unwrap();
        let job = request.into_job();
        assert_eq!(job.requested_args, vec!["-preset", "fast", "-crf", "20"]);
        assert_eq!(job.priority, 3);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateJobRequest =
            serde_json::from_str(r#"{"input_path":"a","output_path":"b"}"#).unwrap();
        let job = request.into_job();
        assert!(job.requested_args.is_empty());
        assert_eq!(job.priority, 0);
        assert!(job.metadata.is_empty());
    }
}
