//! flixsrota: a priority job queue that turns source videos into adaptive
//! bitrate HLS renditions with ffmpeg.
//!
//! Jobs are admitted into a [`queue::JobStore`], handed to a fixed
//! [`worker::WorkerPool`] by the [`worker::JobProcessor`], and executed by a
//! [`transcode::Executor`].

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod queue;
pub mod storage;
pub mod transcode;
pub mod worker;

pub use error::{Error, Result};
