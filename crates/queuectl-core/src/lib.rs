pub mod config;
pub mod error;
pub mod jobs;
pub mod schema;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use jobs::{create_pool, EnqueueOptions, EnqueueRequest, Job, JobId, JobState, Store, Supervisor, Worker};

/// Current version of queuectl-core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
