//! Deadline-bound ffmpeg execution.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::command::HlsCommandBuilder;
use super::tiers::QualityTier;
use crate::config::FfmpegConfig;
use crate::{Error, Result};

/// How long to wait for the stderr reader after the child is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The process could not be started.
    Spawn(String),
    /// Waiting on the process failed.
    Io(String),
    /// The process exited unsuccessfully. `code` is `None` when killed by a signal.
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The deadline passed and the process was killed.
    DeadlineExceeded { timeout: Duration },
    /// The job was cancelled and the process was killed.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "spawn failed: {}", e),
            Self::Io(e) => write!(f, "wait failed: {}", e),
            Self::Exit {
                program,
                code,
                stderr,
            } => {
                match code {
                    Some(code) => write!(f, "{} exited with code {}", program, code)?,
                    None => write!(f, "{} was terminated by a signal", program)?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            Self::DeadlineExceeded { timeout } => {
                write!(f, "deadline exceeded after {}s", timeout.as_secs_f64())
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { duration: Duration },
    Failure(FailureReason),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Raw result of [`run_process`].
#[derive(Debug)]
pub struct ProcessRun {
    /// OS process id, if the process was spawned.
    pub pid: Option<u32>,
    pub outcome: ExecutionOutcome,
}

/// Run `program` until it exits, `timeout` elapses, or `cancel` fires.
///
/// The deadline is fixed when this is called. On timeout or cancellation the
/// child is killed and reaped before returning. At most `stderr_limit` bytes
/// of the stderr tail are kept.
pub async fn run_process(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
    stderr_limit: usize,
) -> ProcessRun {
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;

    let mut command = process_utils::tokio_command(program);
    command
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessRun {
                pid: None,
                outcome: ExecutionOutcome::Failure(FailureReason::Spawn(format!(
                    "{}: {}",
                    program, e
                ))),
            };
        }
    };
    let pid = child.id();

    let stderr_reader = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(process_utils::read_tail(stderr, stderr_limit)));

    enum Ended {
        Exited(std::io::Result<std::process::ExitStatus>),
        Deadline,
        Cancelled,
    }

    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Ended::Deadline,
        _ = cancel.cancelled() => Ended::Cancelled,
    };

    if matches!(ended, Ended::Deadline | Ended::Cancelled)
        && let Err(e) = child.kill().await
    {
        warn!(pid, error = %e, "Failed to kill child process");
    }

    let stderr = match stderr_reader {
        Some(handle) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(tail)) => tail.into_string(),
            _ => String::new(),
        },
        None => String::new(),
    };

    let outcome = match ended {
        Ended::Exited(Ok(status)) if status.success() => ExecutionOutcome::Success {
            duration: start.elapsed(),
        },
        Ended::Exited(Ok(status)) => ExecutionOutcome::Failure(FailureReason::Exit {
            program: program_name(program),
            code: status.code(),
            stderr,
        }),
        Ended::Exited(Err(e)) => ExecutionOutcome::Failure(FailureReason::Io(e.to_string())),
        Ended::Deadline => ExecutionOutcome::Failure(FailureReason::DeadlineExceeded { timeout }),
        Ended::Cancelled => ExecutionOutcome::Failure(FailureReason::Cancelled),
    };

    ProcessRun { pid, outcome }
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// Everything the executor needs for one job.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub job_id: String,
    /// Resolved input path.
    pub input: String,
    /// Resolved variant playlist path.
    pub output: String,
    pub tiers: Vec<&'static QualityTier>,
    pub overrides: Vec<String>,
}

/// Runs a transcode request to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &TranscodeRequest, cancel: CancellationToken)
    -> ExecutionOutcome;

    /// Check that the tool is usable.
    async fn validate(&self) -> Result<()>;
}

/// [`Executor`] backed by the ffmpeg binary.
pub struct FfmpegExecutor {
    config: FfmpegConfig,
    builder: HlsCommandBuilder,
}

impl FfmpegExecutor {
    pub fn new(config: FfmpegConfig) -> Self {
        let builder = HlsCommandBuilder::new().with_global_args(config.global_args.clone());
        Self { config, builder }
    }

    pub fn builder(&self) -> &HlsCommandBuilder {
        &self.builder
    }
}

#[async_trait]
impl Executor for FfmpegExecutor {
    async fn execute(
        &self,
        request: &TranscodeRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let args = self.builder.build_args(
            &request.input,
            &request.output,
            &request.tiers,
            &request.overrides,
        );

        debug!(
            job_id = %request.job_id,
            executable = %self.config.executable_path,
            args = ?args,
            "Running ffmpeg"
        );

        let run = run_process(
            &self.config.executable_path,
            &args,
            self.config.timeout(),
            &cancel,
            self.config.stderr_limit_bytes,
        )
        .await;

        debug!(job_id = %request.job_id, pid = ?run.pid, success = run.outcome.is_success(), "ffmpeg finished");
        run.outcome
    }

    async fn validate(&self) -> Result<()> {
        let run = run_process(
            &self.config.executable_path,
            &["-version".to_string()],
            Duration::from_secs(10),
            &CancellationToken::new(),
            self.config.stderr_limit_bytes,
        )
        .await;

        match run.outcome {
            ExecutionOutcome::Success { .. } => Ok(()),
            ExecutionOutcome::Failure(reason) => Err(Error::config(format!(
                "ffmpeg not found or not executable at '{}': {}",
                self.config.executable_path, reason
            ))),
        }
    }
}
