//! Persistence jobs: selected records appended to a per-job data container while an index
//! container mirrors the resulting [`PersistentIndexTree`](crate::storage::index::persistent_tree::PersistentIndexTree).

pub mod job;
pub mod manager;

pub use job::{IndexFrame, JobHandle, JobReport, JobStatus, WritingStatus};
pub use manager::PersistenceManager;
