//! The job lifecycle engine: Store (persistence), Policy (pure backoff
//! rules), Executor (subprocess management), Worker (per-slot state
//! machine), Supervisor (fleet lifecycle).

pub mod dead_letter;
pub mod executor;
pub mod job;
pub mod policy;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use job::{EnqueueOptions, EnqueueRequest, Job, JobId, JobState};
pub use store::{create_pool, Store};
pub use supervisor::Supervisor;
pub use worker::Worker;
