//! Job repository. Uniqueness: `(org_id, platform, thread_key)`.

use crate::db::tx::Exec;
use crate::error::{DispatchError, Result};
use crate::with_exec;
use crate::{ids, ChatPlatform, Job, JobStatus};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct JobRepo {
    pool: SqlitePool,
}

impl JobRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find the Job bound to this thread, creating one in `Queued` status
    /// if this is the first message on the thread.
    pub async fn find_or_create(
        &self,
        org_id: &str,
        channel_id: &str,
        platform: ChatPlatform,
        thread_key: &str,
    ) -> Result<Job> {
        if let Some(existing) = self.find_by_thread(org_id, platform, thread_key).await? {
            return Ok(existing);
        }

        let id = ids::generate("job");
        with_exec!(self, |ex| {
            sqlx::query(
                "INSERT OR IGNORE INTO jobs (id, org_id, channel_id, platform, thread_key, status) VALUES (?, ?, ?, ?, ?, 'queued')",
            )
            .bind(&id)
            .bind(org_id)
            .bind(channel_id)
            .bind(platform.as_str())
            .bind(thread_key)
            .execute(ex)
            .await
            .context("failed to insert job")?;
        });

        self.find_by_thread(org_id, platform, thread_key)
            .await?
            .context("job inserted but not found")
            .map_err(Into::into)
    }

    pub async fn find_by_thread(
        &self,
        org_id: &str,
        platform: ChatPlatform,
        thread_key: &str,
    ) -> Result<Option<Job>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, channel_id, platform, thread_key, status, created_at, updated_at FROM jobs WHERE org_id = ? AND platform = ? AND thread_key = ?",
            )
            .bind(org_id)
            .bind(platform.as_str())
            .bind(thread_key)
            .fetch_optional(ex)
            .await
            .context("failed to fetch job by thread")?
        });

        row.map(job_from_row).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, channel_id, platform, thread_key, status, created_at, updated_at FROM jobs WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch job")?
        });

        row.map(job_from_row).transpose()
    }

    pub async fn list_for_org(&self, org_id: &str, limit: i64) -> Result<Vec<Job>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, channel_id, platform, thread_key, status, created_at, updated_at FROM jobs WHERE org_id = ? ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(org_id)
            .bind(limit.clamp(1, 500))
            .fetch_all(ex)
            .await
            .context("failed to list jobs")?
        });

        rows.into_iter().map(job_from_row).collect()
    }

    /// Set `status`, enforcing the transition table. `current` must be the
    /// caller's last-known status (checked via `WHERE status = ?` so a
    /// concurrent transition loses the race rather than clobbering).
    pub async fn set_status(
        &self,
        id: &str,
        current: JobStatus,
        next: JobStatus,
    ) -> Result<bool> {
        let result = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE jobs SET status = ?, updated_at = datetime('now') WHERE id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(id)
            .bind(current.as_str())
            .execute(ex)
            .await
            .context("failed to update job status")?
        });

        Ok(result.rows_affected() > 0)
    }

    /// Jobs with at least one QUEUED message, oldest such message first —
    /// the Dispatcher's promote-queued sub-task works this list in order
    /// (spec.md §4.4 "Load jobs that have at least one QUEUED processed
    /// message, oldest job first").
    pub async fn list_with_queued_messages(&self) -> Result<Vec<Job>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT jobs.id, jobs.org_id, jobs.channel_id, jobs.platform, jobs.thread_key, jobs.status, jobs.created_at, jobs.updated_at \
                 FROM jobs \
                 JOIN ( \
                     SELECT job_id, MIN(created_at) AS oldest_queued_at \
                     FROM processed_messages \
                     WHERE status = 'queued' \
                     GROUP BY job_id \
                 ) q ON q.job_id = jobs.id \
                 ORDER BY q.oldest_queued_at ASC",
            )
            .fetch_all(ex)
            .await
            .context("failed to list jobs with queued messages")?
        });

        rows.into_iter().map(job_from_row).collect()
    }

    /// Jobs whose messages are all `Completed` with no activity for longer
    /// than `idle_for` — candidates for the Dispatcher's idle-job-cleanup
    /// sub-task (spec.md §4.5). A job with any non-`Completed` message, or
    /// no messages at all, never appears here.
    pub async fn list_idle_completed(&self, idle_for: chrono::Duration) -> Result<Vec<Job>> {
        let cutoff = chrono::Utc::now() - idle_for;
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, channel_id, platform, thread_key, status, created_at, updated_at FROM jobs \
                 WHERE status = 'completed' AND updated_at < ? \
                 AND NOT EXISTS ( \
                   SELECT 1 FROM processed_messages \
                   WHERE processed_messages.job_id = jobs.id AND processed_messages.status != 'completed' \
                 )",
            )
            .bind(cutoff.naive_utc())
            .fetch_all(ex)
            .await
            .context("failed to list idle jobs")?
        });

        rows.into_iter().map(job_from_row).collect()
    }

    /// Delete a job and its processed messages, releasing any surviving
    /// assignment first. Called only once idle-job-cleanup has confirmed
    /// every message is `Completed`.
    pub async fn delete_with_messages(&self, id: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query("DELETE FROM agent_job_assignments WHERE job_id = ?")
                .bind(id)
                .execute(ex)
                .await
                .context("failed to delete assignments for job")?;
        });
        with_exec!(self, |ex| {
            sqlx::query("DELETE FROM conversation_costs WHERE job_id = ?")
                .bind(id)
                .execute(ex)
                .await
                .context("failed to delete conversation cost for job")?;
        });
        with_exec!(self, |ex| {
            sqlx::query("DELETE FROM processed_messages WHERE job_id = ?")
                .bind(id)
                .execute(ex)
                .await
                .context("failed to delete processed messages for job")?;
        });
        with_exec!(self, |ex| {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(ex)
                .await
                .context("failed to delete job")?;
        });
        Ok(())
    }
}


fn job_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let platform_value: String = row.try_get("platform").context("failed to read job platform")?;
    let status_value: String = row.try_get("status").context("failed to read job status")?;

    Ok(Job {
        id: row.try_get("id").context("failed to read job id")?,
        org_id: row.try_get("org_id").context("failed to read job org_id")?,
        channel_id: row.try_get("channel_id").context("failed to read job channel_id")?,
        platform: platform_value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid platform in database: {platform_value}"))?,
        thread_key: row.try_get("thread_key").context("failed to read job thread_key")?,
        status: status_value
            .parse()
            .map_err(|e: DispatchError| anyhow::anyhow!(e.to_string()))?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read job created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|v| v.and_utc())
            .context("failed to read job updated_at")?,
    })
}
