//! ffmpeg command synthesis and execution.

pub mod command;
pub mod executor;
pub mod tiers;

pub use command::{FfmpegCommand, HlsCommandBuilder};
pub use executor::{
    ExecutionOutcome, Executor, FailureReason, FfmpegExecutor, ProcessRun, TranscodeRequest,
    run_process,
};
pub use tiers::{QualityTier, ResolvedTiers, TIERS, find_tier, resolve_tiers};
