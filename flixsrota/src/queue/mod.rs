//! Job records and the priority job store.

pub mod job;
pub mod memory;
pub mod retention;
pub mod sqlite;
pub mod store;

pub use job::{Job, JobStatus};
pub use memory::MemoryJobStore;
pub use retention::{RetentionConfig, RetentionService};
pub use sqlite::SqliteJobStore;
pub use store::{JobPage, JobStore};
