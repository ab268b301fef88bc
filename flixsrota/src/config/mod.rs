//! Application configuration.
//!
//! Every setting has a default; `FLIXSROTA_*` environment variables override
//! them. A `.env` file in the working directory is read first by the binary.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::RetentionConfig;
use crate::{Error, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FLIXSROTA_";

/// Which job store implementation to open.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// How the coordinator pairs jobs with workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Wait for an idle worker before dequeuing.
    WorkerFirst,
    /// Dequeue every tick and re-enqueue when no worker is idle.
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub backend: StoreBackend,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:flixsrota.db?mode=rwc".to_string(),
            backend: StoreBackend::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fixed pool size.
    pub min_workers: usize,
    /// Upper bound accepted by validation; the pool never grows past `min_workers`.
    pub max_workers: usize,
    /// Coordinator tick.
    pub poll_interval_ms: u64,
    pub dispatch_strategy: DispatchStrategy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            poll_interval_ms: 1000,
            dispatch_strategy: DispatchStrategy::WorkerFirst,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    pub executable_path: String,
    pub timeout_secs: u64,
    /// Enabled quality tier names.
    pub qualities: Vec<String>,
    /// Options placed before `-i` on every invocation.
    pub global_args: Vec<String>,
    /// Bytes of stderr kept for failure reports.
    pub stderr_limit_bytes: usize,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            executable_path: "ffmpeg".to_string(),
            timeout_secs: 3600,
            qualities: vec!["360p".to_string(), "480p".to_string(), "720p".to_string()],
            global_args: Vec::new(),
            stderr_limit_bytes: 4096,
        }
    }
}

impl FfmpegConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub temp_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/flixsrota"),
            temp_path: PathBuf::from("/tmp/flixsrota/temp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub ffmpeg: FfmpegConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to read variables by full name.
    ///
    /// Empty values are treated as unset. Values that fail to parse are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(url) = env.string("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(backend) = env.parse("STORE")? {
            config.database.backend = backend;
        }

        if let Some(n) = env.parse("WORKER_MIN_WORKERS")? {
            config.worker.min_workers = n;
        }
        if let Some(n) = env.parse("WORKER_MAX_WORKERS")? {
            config.worker.max_workers = n;
        }
        if let Some(ms) = env.parse("WORKER_POLL_INTERVAL_MS")? {
            config.worker.poll_interval_ms = ms;
        }
        if let Some(strategy) = env.parse("WORKER_DISPATCH_STRATEGY")? {
            config.worker.dispatch_strategy = strategy;
        }

        if let Some(path) = env.string("FFMPEG_EXECUTABLE_PATH") {
            config.ffmpeg.executable_path = path;
        }
        if let Some(secs) = env.parse("FFMPEG_TIMEOUT")? {
            config.ffmpeg.timeout_secs = secs;
        }
        if let Some(list) = env.string("FFMPEG_QUALITIES") {
            config.ffmpeg.qualities = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(args) = env.string("FFMPEG_GLOBAL_ARGS") {
            config.ffmpeg.global_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(bytes) = env.parse("FFMPEG_STDERR_LIMIT_BYTES")? {
            config.ffmpeg.stderr_limit_bytes = bytes;
        }

        if let Some(path) = env.string("STORAGE_LOCAL_BASE_PATH") {
            config.storage.base_path = PathBuf::from(path);
        }
        if let Some(path) = env.string("STORAGE_LOCAL_TEMP_PATH") {
            config.storage.temp_path = PathBuf::from(path);
        }

        if let Some(addr) = env.string("API_BIND_ADDRESS") {
            config.api.bind_address = addr;
        }
        if let Some(port) = env.parse("API_PORT")? {
            config.api.port = port;
        }
        if let Some(enabled) = env.parse("API_ENABLE_CORS")? {
            config.api.enable_cors = enabled;
        }

        if let Some(secs) = env.parse("RETENTION_SECS")? {
            config.retention.retention_secs = secs;
        }
        if let Some(secs) = env.parse("RETENTION_CHECK_INTERVAL_SECS")? {
            config.retention.check_interval_secs = secs;
        }

        if let Some(dir) = env.string("LOG_DIR") {
            config.logging.dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.min_workers < 1 {
            return Err(Error::config("worker.min_workers must be at least 1"));
        }
        if self.worker.max_workers < self.worker.min_workers {
            return Err(Error::config(
                "worker.max_workers must be greater than or equal to worker.min_workers",
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(Error::config("worker.poll_interval_ms must be positive"));
        }
        if self.ffmpeg.timeout_secs == 0 {
            return Err(Error::config("ffmpeg.timeout must be positive"));
        }
        if self.ffmpeg.executable_path.trim().is_empty() {
            return Err(Error::config("ffmpeg.executable_path must not be empty"));
        }
        if self.api.port == 0 {
            return Err(Error::config("api.port must be between 1 and 65535"));
        }
        if self.database.backend == StoreBackend::Sqlite && self.database.url.trim().is_empty() {
            return Err(Error::config("database.url must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "store:             {} ({})", self.database.backend, self.database.url)?;
        writeln!(
            f,
            "workers:           {} (max {}), tick {}ms, {}",
            self.worker.min_workers,
            self.worker.max_workers,
            self.worker.poll_interval_ms,
            self.worker.dispatch_strategy
        )?;
        writeln!(
            f,
            "ffmpeg:            {} (timeout {}s)",
            self.ffmpeg.executable_path, self.ffmpeg.timeout_secs
        )?;
        writeln!(f, "qualities:         {}", self.ffmpeg.qualities.join(", "))?;
        writeln!(
            f,
            "storage:           {} (temp {})",
            self.storage.base_path.display(),
            self.storage.temp_path.display()
        )?;
        writeln!(
            f,
            "api:               {}:{}",
            self.api.bind_address, self.api.port
        )?;
        writeln!(
            f,
            "retention:         {}s (every {}s)",
            self.retention.retention_secs, self.retention.check_interval_secs
        )?;
        write!(f, "log dir:           {}", self.logging.dir.display())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.string(key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("{ENV_PREFIX}{key}={raw:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.worker.min_workers, 2);
        assert_eq!(config.worker.max_workers, 10);
        assert_eq!(config.worker.poll_interval_ms, 1000);
        assert_eq!(config.worker.dispatch_strategy, DispatchStrategy::WorkerFirst);
        assert_eq!(config.ffmpeg.timeout_secs, 3600);
        assert_eq!(config.ffmpeg.qualities, vec!["360p", "480p", "720p"]);
        assert_eq!(config.database.backend, StoreBackend::Sqlite);
        assert_eq!(config.retention.retention_secs, 86_400);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("FLIXSROTA_STORE", "memory"),
            ("FLIXSROTA_WORKER_MIN_WORKERS", "4"),
            ("FLIXSROTA_WORKER_DISPATCH_STRATEGY", "requeue"),
            ("FLIXSROTA_FFMPEG_QUALITIES", "1080p, 720p,,"),
            ("FLIXSROTA_FFMPEG_GLOBAL_ARGS", "-loglevel error"),
            ("FLIXSROTA_API_PORT", "9000"),
            ("FLIXSROTA_API_BIND_ADDRESS", "   "),
        ])
        .unwrap();

        assert_eq!(config.database.backend, StoreBackend::Memory);
        assert_eq!(config.worker.min_workers, 4);
        assert_eq!(config.worker.dispatch_strategy, DispatchStrategy::Requeue);
        assert_eq!(config.ffmpeg.qualities, vec!["1080p", "720p"]);
        assert_eq!(config.ffmpeg.global_args, vec!["-loglevel", "error"]);
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_unparsable_value_is_an_error() {
        let err = load(&[("FLIXSROTA_WORKER_MIN_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("FLIXSROTA_WORKER_MIN_WORKERS"));
    }

    #[test]
    fn test_validate_rejects_bad_worker_bounds() {
        let mut config = AppConfig::default();
        config.worker.min_workers = 0;
        assert!(config.validate().is_err());

        config.worker.min_workers = 5;
        config.worker.max_workers = 3;
        assert!(config.validate().is_err());

        config.worker.max_workers = 5;
        config.ffmpeg.timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
