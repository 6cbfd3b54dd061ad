//! Schema bootstrap for `init`. There is exactly one schema version, so
//! this is a single idempotent routine rather than a versioned migration
//! framework -- unlike a multi-tenant database, the engine's two tables
//! never need migrating between releases that matter here.

use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::config::{CONFIG_KEY_BACKOFF_BASE, CONFIG_KEY_MAX_RETRIES, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};
use crate::Result;

/// Creates the `jobs` and `config` tables if absent, and seeds the two
/// default config rows (`max_retries=3`, `backoff_base=2`) if they are not
/// already present.
pub async fn init(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT PRIMARY KEY,
            command     TEXT      NOT NULL,
            state       TEXT      NOT NULL DEFAULT 'pending',
            attempts    INTEGER   NOT NULL DEFAULT 0,
            max_retries INTEGER   NOT NULL DEFAULT 3,
            priority    INTEGER   NOT NULL DEFAULT 0,
            timeout     INTEGER   NOT NULL DEFAULT 300,
            run_at      TIMESTAMP,
            created_at  TIMESTAMP NOT NULL,
            updated_at  TIMESTAMP NOT NULL,
            started_at  TIMESTAMP,
            completed_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs (state, priority DESC, created_at ASC)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
        .bind(CONFIG_KEY_MAX_RETRIES)
        .bind(DEFAULT_MAX_RETRIES)
        .execute(pool)
        .await?;

    sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
        .bind(CONFIG_KEY_BACKOFF_BASE)
        .bind(DEFAULT_BACKOFF_BASE)
        .execute(pool)
        .await?;

    info!("database initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::create_pool;

    #[tokio::test]
    async fn init_is_idempotent_and_seeds_defaults() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        init(&pool).await.unwrap();
        init(&pool).await.unwrap();

        let row: (String,) = sqlx::query_as("SELECT value FROM config WHERE key = 'max_retries'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, "3");
    }
}
