//! The dead letter queue is not a data structure of its own -- it is the
//! logical set of jobs in state `dead`, queried straight out of the Store
//! (see the GLOSSARY). This module holds only thin presentation helpers
//! for the `dlq list`/`dlq retry` CLI commands.

use crate::jobs::job::{Job, JobState};
use crate::jobs::store::Store;
use crate::Result;

/// Lists every job currently in the dead letter queue, ordered the same
/// way `Store::get_by_state` orders any other state.
pub async fn list(store: &Store) -> Result<Vec<Job>> {
    store.get_by_state(JobState::Dead).await
}

/// Moves one job out of the dead letter queue back to `pending`.
pub async fn retry(store: &Store, job_id: &str) -> Result<Job> {
    store.retry_dlq(job_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::EnqueueOptions;
    use crate::jobs::store::create_pool;

    async fn test_store() -> Store {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY, command TEXT NOT NULL, state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0, max_retries INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 0, timeout INTEGER NOT NULL DEFAULT 300,
                run_at TIMESTAMP, created_at TIMESTAMP NOT NULL, updated_at TIMESTAMP NOT NULL,
                started_at TIMESTAMP, completed_at TIMESTAMP
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        Store::new(pool)
    }

    #[tokio::test]
    async fn list_is_empty_until_a_job_dies() {
        let store = test_store().await;
        store
            .enqueue(
                "a",
                "exit 1",
                EnqueueOptions {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(list(&store).await.unwrap().is_empty());

        store.lease().await.unwrap();
        store.finalize("a", false).await.unwrap();

        let dead = list(&store).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, "a");

        let revived = retry(&store, "a").await.unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert!(list(&store).await.unwrap().is_empty());
    }
}
