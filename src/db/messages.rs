//! Processed Message repository. Uniqueness: `(job_id, platform_message_id)`
//! — duplicate platform deliveries of the same message are idempotent.

use crate::db::tx::Exec;
use crate::error::{DispatchError, Result};
use crate::with_exec;
use crate::{ids, MessageStatus, ProcessedMessage};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly-arrived message in `Queued` status. Returns `None`
    /// if `(job_id, platform_message_id)` already exists — the caller should
    /// treat this as an already-handled duplicate delivery, not an error.
    pub async fn create_if_new(
        &self,
        org_id: &str,
        job_id: &str,
        user_id: &str,
        platform_message_id: &str,
        body: &str,
    ) -> Result<Option<ProcessedMessage>> {
        let id = ids::generate("msg");
        let insert = with_exec!(self, |ex| {
            sqlx::query(
                "INSERT OR IGNORE INTO processed_messages (id, org_id, job_id, user_id, platform_message_id, body, status) VALUES (?, ?, ?, ?, ?, ?, 'queued')",
            )
            .bind(&id)
            .bind(org_id)
            .bind(job_id)
            .bind(user_id)
            .bind(platform_message_id)
            .bind(body)
            .execute(ex)
            .await
            .context("failed to insert processed message")?
        });

        if insert.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ProcessedMessage>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, job_id, user_id, platform_message_id, body, status, error_text, posted_reply_id, created_at, updated_at FROM processed_messages WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch processed message")?
        });

        row.map(message_from_row).transpose()
    }

    /// Oldest `Queued` message for a job, if any — the Dispatcher's
    /// promote-queued sub-task drives one job forward at a time.
    pub async fn oldest_queued_for_job(&self, job_id: &str) -> Result<Option<ProcessedMessage>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, job_id, user_id, platform_message_id, body, status, error_text, posted_reply_id, created_at, updated_at FROM processed_messages WHERE job_id = ? AND status = 'queued' ORDER BY created_at ASC LIMIT 1",
            )
            .bind(job_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch oldest queued message")?
        });

        row.map(message_from_row).transpose()
    }

    /// The job's IN_PROGRESS message, if any (P2: at most one). Used on
    /// agent disconnect/eviction to find what needs demoting back to QUEUED.
    pub async fn in_progress_for_job(&self, job_id: &str) -> Result<Option<ProcessedMessage>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, job_id, user_id, platform_message_id, body, status, error_text, posted_reply_id, created_at, updated_at FROM processed_messages WHERE job_id = ? AND status = 'in_progress' LIMIT 1",
            )
            .bind(job_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch in-progress message")?
        });

        row.map(message_from_row).transpose()
    }

    /// Enforces the state machine's transition table (P1): no skipped or
    /// reversed transitions, no-ops once `Completed` (P3).
    pub async fn set_status(
        &self,
        id: &str,
        current: MessageStatus,
        next: MessageStatus,
    ) -> Result<bool> {
        if !current.can_transition_to(next) {
            return Err(DispatchError::InvalidStatusTransition {
                message_id: id.to_string(),
                from: status_name(current),
                to: status_name(next),
            }
            .into());
        }

        let result = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE processed_messages SET status = ?, updated_at = datetime('now') WHERE id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(id)
            .bind(current.as_str())
            .execute(ex)
            .await
            .context("failed to update processed message status")?
        });

        Ok(result.rows_affected() > 0)
    }

    /// Move a message to `Completed`, recording the agent's error text if the
    /// terminal frame was `error` rather than `result` (spec.md §7). `None`
    /// leaves `error_text` unset — the success path.
    pub async fn complete(
        &self,
        id: &str,
        current: MessageStatus,
        error_text: Option<&str>,
    ) -> Result<bool> {
        if !current.can_transition_to(MessageStatus::Completed) {
            return Err(DispatchError::InvalidStatusTransition {
                message_id: id.to_string(),
                from: status_name(current),
                to: status_name(MessageStatus::Completed),
            }
            .into());
        }

        let result = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE processed_messages SET status = 'completed', error_text = ?, updated_at = datetime('now') WHERE id = ? AND status = ?",
            )
            .bind(error_text)
            .bind(id)
            .bind(current.as_str())
            .execute(ex)
            .await
            .context("failed to complete processed message")?
        });

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_posted_reply_id(&self, id: &str, posted_reply_id: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE processed_messages SET posted_reply_id = ?, updated_at = datetime('now') WHERE id = ?",
            )
            .bind(posted_reply_id)
            .bind(id)
            .execute(ex)
            .await
            .context("failed to set posted_reply_id")?;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::jobs::JobRepo;
    use crate::ChatPlatform;

    async fn seed_job(pool: &SqlitePool) -> String {
        JobRepo::new(pool.clone())
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-1")
            .await
            .expect("job should be created")
            .id
    }

    #[tokio::test]
    async fn create_if_new_is_idempotent_on_duplicate_delivery() {
        let pool = connect_in_memory().await;
        let job_id = seed_job(&pool).await;
        let repo = MessageRepo::new(pool);

        let first = repo
            .create_if_new("org1", &job_id, "user1", "platform-msg-1", "hello")
            .await
            .expect("first insert should succeed")
            .expect("first insert should be new");

        let second = repo
            .create_if_new("org1", &job_id, "user1", "platform-msg-1", "hello")
            .await
            .expect("duplicate insert should not error");

        assert!(second.is_none(), "a duplicate platform_message_id must be a silent no-op (P6)");
        assert_eq!(first.status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn set_status_rejects_skipped_transition() {
        let pool = connect_in_memory().await;
        let job_id = seed_job(&pool).await;
        let repo = MessageRepo::new(pool);
        let message = repo
            .create_if_new("org1", &job_id, "user1", "platform-msg-1", "hello")
            .await
            .unwrap()
            .unwrap();

        let result = repo.set_status(&message.id, MessageStatus::Queued, MessageStatus::Completed).await;
        assert!(result.is_err(), "queued -> completed skips in_progress and must be rejected (P1)");
    }

    #[tokio::test]
    async fn complete_is_noop_once_already_completed() {
        let pool = connect_in_memory().await;
        let job_id = seed_job(&pool).await;
        let repo = MessageRepo::new(pool);
        let message = repo
            .create_if_new("org1", &job_id, "user1", "platform-msg-1", "hello")
            .await
            .unwrap()
            .unwrap();

        repo.set_status(&message.id, MessageStatus::Queued, MessageStatus::InProgress)
            .await
            .unwrap();
        repo.complete(&message.id, MessageStatus::InProgress, None).await.unwrap();

        // The transition table allows in_progress -> completed in the
        // abstract, but the row is no longer in_progress, so the DB-level
        // guard (`WHERE status = ?`) is what actually makes this a no-op.
        let applied = repo.complete(&message.id, MessageStatus::InProgress, None).await.unwrap();
        assert!(!applied, "completed is terminal (P3); a second completion attempt must not reapply");
    }

    #[tokio::test]
    async fn complete_with_error_text_records_it() {
        let pool = connect_in_memory().await;
        let job_id = seed_job(&pool).await;
        let repo = MessageRepo::new(pool);
        let message = repo
            .create_if_new("org1", &job_id, "user1", "platform-msg-1", "hello")
            .await
            .unwrap()
            .unwrap();

        repo.set_status(&message.id, MessageStatus::Queued, MessageStatus::InProgress)
            .await
            .unwrap();
        repo.complete(&message.id, MessageStatus::InProgress, Some("agent crashed"))
            .await
            .unwrap();

        let reloaded = repo.get(&message.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, MessageStatus::Completed);
        assert_eq!(reloaded.error_text.as_deref(), Some("agent crashed"));
    }
}

fn status_name(status: MessageStatus) -> &'static str {
    status.as_str()
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ProcessedMessage> {
    let status_value: String = row.try_get("status").context("failed to read message status")?;

    Ok(ProcessedMessage {
        id: row.try_get("id").context("failed to read message id")?,
        org_id: row.try_get("org_id").context("failed to read message org_id")?,
        job_id: row.try_get("job_id").context("failed to read message job_id")?,
        user_id: row.try_get("user_id").context("failed to read message user_id")?,
        platform_message_id: row
            .try_get("platform_message_id")
            .context("failed to read platform_message_id")?,
        body: row.try_get("body").context("failed to read message body")?,
        status: status_value
            .parse()
            .map_err(|e: DispatchError| anyhow::anyhow!(e.to_string()))?,
        error_text: row.try_get("error_text").ok(),
        posted_reply_id: row.try_get("posted_reply_id").ok(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read message created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|v| v.and_utc())
            .context("failed to read message updated_at")?,
    })
}
