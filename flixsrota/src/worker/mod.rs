//! Worker pool and job dispatch.

pub mod dispatcher;
pub mod pool;
pub mod runner;

pub use dispatcher::{DispatchStats, JobProcessor};
pub use pool::{WorkerLease, WorkerPool, WorkerReservation};
pub use runner::{QUALITIES_METADATA_KEY, Worker, WorkerContext};
