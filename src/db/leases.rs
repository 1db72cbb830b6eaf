//! Dispatcher lease repository: one row per sub-task in `dispatcher_leases`,
//! so two coordinator processes never run the same sub-task concurrently.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::with_exec;
use anyhow::Context as _;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct LeaseRepo {
    pool: SqlitePool,
}

impl LeaseRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim `task_name` for `holder` until `expires_at`, succeeding only if
    /// the lease is free or already expired. One coordinator's tick losing
    /// the race is the expected common case, not an error.
    pub async fn acquire(
        &self,
        task_name: &str,
        holder: &str,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let result = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE dispatcher_leases SET holder = ?, expires_at = ? \
                 WHERE task_name = ? AND (holder IS NULL OR expires_at <= datetime('now'))",
            )
            .bind(holder)
            .bind(expires_at.naive_utc())
            .bind(task_name)
            .execute(ex)
            .await
            .context("failed to acquire dispatcher lease")?
        });

        Ok(result.rows_affected() > 0)
    }

    /// Give up `task_name` early, so the next tick's acquire doesn't have to
    /// wait out the full lease duration.
    pub async fn release(&self, task_name: &str, holder: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE dispatcher_leases SET holder = NULL, expires_at = NULL WHERE task_name = ? AND holder = ?",
            )
            .bind(task_name)
            .bind(holder)
            .execute(ex)
            .await
            .context("failed to release dispatcher lease")?;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    // The migration seeds one NULL-holder row per sub-task, so tests rely on
    // that existing row rather than inserting their own.

    #[tokio::test]
    async fn acquire_is_mutually_exclusive_between_holders() {
        let pool = connect_in_memory().await;
        let repo = LeaseRepo::new(pool);

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(15);
        let first = repo.acquire("promote_queued", "holder-a", expires_at).await.unwrap();
        let second = repo.acquire("promote_queued", "holder-b", expires_at).await.unwrap();

        assert!(first, "the first coordinator to ask for a free lease gets it");
        assert!(!second, "a second coordinator must not also acquire the same live lease");
    }

    #[tokio::test]
    async fn release_lets_another_holder_acquire_immediately() {
        let pool = connect_in_memory().await;
        let repo = LeaseRepo::new(pool);

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(15);
        repo.acquire("promote_queued", "holder-a", expires_at).await.unwrap();
        repo.release("promote_queued", "holder-a").await.unwrap();

        let reacquired = repo.acquire("promote_queued", "holder-b", expires_at).await.unwrap();
        assert!(reacquired);
    }

    #[tokio::test]
    async fn acquire_succeeds_once_the_prior_lease_has_expired() {
        let pool = connect_in_memory().await;
        let repo = LeaseRepo::new(pool);

        let already_expired = chrono::Utc::now() - chrono::Duration::seconds(1);
        repo.acquire("promote_queued", "holder-a", already_expired).await.unwrap();

        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(15);
        let acquired = repo.acquire("promote_queued", "holder-b", expires_at).await.unwrap();
        assert!(acquired, "an expired lease is free for the next holder");
    }
}
