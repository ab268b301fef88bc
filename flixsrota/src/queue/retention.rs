//! Periodic eviction of finished jobs.
//!
//! A job becomes eligible once it is terminal, acknowledged, and completed
//! longer ago than the retention window. Nothing in dispatch depends on this
//! running.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::store::JobStore;
use crate::Result;

/// Configuration for job retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Seconds to keep finished jobs. 0 keeps them forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval between eviction passes in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_check_interval_secs() -> u64 {
    600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_secs > 0
    }
}

/// Background TTL eviction over a [`JobStore`].
pub struct RetentionService {
    config: RetentionConfig,
    store: Arc<dyn JobStore>,
}

impl RetentionService {
    pub fn new(config: RetentionConfig, store: Arc<dyn JobStore>) -> Self {
        Self { config, store }
    }

    /// Run a single eviction pass and return the number of jobs removed.
    pub async fn run_once(&self) -> Result<u64> {
        if !self.config.is_enabled() {
            debug!("Job retention disabled (retention_secs = 0)");
            return Ok(0);
        }

        let cutoff = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            // A window reaching past the representable range keeps everything.
            return Ok(0);
        };
        let evicted = self.store.evict_expired(cutoff).await?;

        if evicted > 0 {
            info!(
                evicted,
                retention_secs = self.config.retention_secs,
                "Evicted expired jobs"
            );
        } else {
            debug!("No jobs to evict");
        }

        Ok(evicted)
    }

    /// Spawn the periodic eviction loop.
    pub fn start_background_task(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.check_interval_secs.max(1));
            let mut check_interval = interval(period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job retention service started (retention: {}s, interval: {}s)",
                self.config.retention_secs,
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job retention service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!("Retention pass failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, MemoryJobStore};

    #[test]
    fn test_retention_config_builder() {
        let config = RetentionConfig::new()
            .with_retention_secs(60)
            .with_check_interval_secs(5);
        assert_eq!(config.retention_secs, 60);
        assert_eq!(config.check_interval_secs, 5);
        assert!(config.is_enabled());
        assert!(!RetentionConfig::new().with_retention_secs(0).is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_retention_keeps_everything() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        store.cancel_job(&id).await.unwrap();

        let service = RetentionService::new(RetentionConfig::new().with_retention_secs(0), store.clone());
        assert_eq!(service.run_once().await.unwrap(), 0);
        assert!(store.get_job(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_recent_jobs_survive_window() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(Job::new("a", "a")).await.unwrap();
        store.cancel_job(&id).await.unwrap();

        let service = RetentionService::new(RetentionConfig::new().with_retention_secs(3600), store.clone());
        assert_eq!(service.run_once().await.unwrap(), 0);
        assert!(store.get_job(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_background_task_stops_on_cancel() {
        let store = Arc::new(MemoryJobStore::new());
        let token = CancellationToken::new();
        let handle = RetentionService::new(RetentionConfig::default(), store)
            .start_background_task(token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
