//! Row models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{datetime_to_ms, ms_to_datetime};
use crate::queue::{Job, JobStatus};
use crate::{Error, Result};

/// `jobs` table row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub input_locator: String,
    pub output_locator: String,
    /// JSON array of override tokens
    pub requested_args: String,
    pub priority: i64,
    /// Status: queued, processing, completed, failed, cancelled
    pub status: String,
    pub progress: f64,
    pub error_detail: Option<String>,
    /// JSON object of caller metadata
    pub metadata: String,
    /// Unix epoch milliseconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Set once the queue side is done with the job.
    pub acknowledged_at: Option<i64>,
    pub updated_at: i64,
}

impl JobDbModel {
    pub fn from_job(job: &Job, updated_at: i64) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            input_locator: job.input_locator.clone(),
            output_locator: job.output_locator.clone(),
            requested_args: serde_json::to_string(&job.requested_args)?,
            priority: i64::from(job.priority),
            status: job.status.as_str().to_string(),
            progress: job.progress,
            error_detail: job.error_detail.clone(),
            metadata: serde_json::to_string(&job.metadata)?,
            created_at: datetime_to_ms(job.created_at),
            started_at: job.started_at.map(datetime_to_ms),
            completed_at: job.completed_at.map(datetime_to_ms),
            acknowledged_at: None,
            updated_at,
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let status: JobStatus = self.status.parse().map_err(|_| {
            Error::Other(format!("job {} has unknown status '{}'", self.id, self.status))
        })?;
        let requested_args: Vec<String> = serde_json::from_str(&self.requested_args)?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)?;
        let priority = i32::try_from(self.priority)
            .map_err(|_| Error::Other(format!("job {} has out-of-range priority", self.id)))?;

        Ok(Job {
            id: self.id,
            input_locator: self.input_locator,
            output_locator: self.output_locator,
            requested_args,
            priority,
            status,
            progress: self.progress,
            error_detail: self.error_detail,
            metadata,
            created_at: ms_to_datetime(self.created_at),
            started_at: self.started_at.map(ms_to_datetime),
            completed_at: self.completed_at.map(ms_to_datetime),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_preserves_job_fields() {
        let mut job = Job::new("in.mp4", "out/v%v/index.m3u8")
            .with_priority(-3)
            .with_requested_args(["-preset", "fast"])
            .with_metadata("k", "v");
        job.id = "job-1".to_string();

        let model = JobDbModel::from_job(&job, 0).unwrap();
        assert_eq!(model.status, "queued");
        assert_eq!(model.requested_args, r#"["-preset","fast"]"#);

        let back = model.into_job().unwrap();
        assert_eq!(back.id, "job-1");
        assert_eq!(back.priority, -3);
        assert_eq!(back.requested_args, job.requested_args);
        assert_eq!(back.metadata, job.metadata);
        assert_eq!(
            back.created_at.timestamp_millis(),
            job.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let mut job = Job::new("in", "out");
        job.id = "x".to_string();
        let mut model = JobDbModel::from_job(&job, 0).unwrap();
        model.status = "PENDING".to_string();
        assert!(model.into_job().is_err());
    }
}
