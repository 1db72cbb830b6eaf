//! Active Agent repository. Uniqueness: `(org_id, ccagent_id)`.

use crate::db::tx::Exec;
use crate::error::Result;
use crate::with_exec;
use crate::{ids, ActiveAgent};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct AgentRepo {
    pool: SqlitePool,
}

impl AgentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record (or refresh) an agent's presence after a successful `hello`
    /// handshake.
    pub async fn upsert_active(
        &self,
        org_id: &str,
        ccagent_id: &str,
        capacity: u32,
    ) -> Result<ActiveAgent> {
        let id = ids::generate("agt");
        with_exec!(self, |ex| {
            sqlx::query(
                "INSERT INTO active_agents (id, org_id, ccagent_id, capacity, last_seen_at) VALUES (?, ?, ?, ?, datetime('now')) \
                 ON CONFLICT(org_id, ccagent_id) DO UPDATE SET capacity = excluded.capacity, last_seen_at = datetime('now')",
            )
            .bind(&id)
            .bind(org_id)
            .bind(ccagent_id)
            .bind(capacity)
            .execute(ex)
            .await
            .context("failed to upsert active agent")?;
        });

        self.get_by_ccagent_id(org_id, ccagent_id)
            .await?
            .context("active agent upserted but not found")
            .map_err(Into::into)
    }

    pub async fn touch(&self, org_id: &str, ccagent_id: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE active_agents SET last_seen_at = datetime('now') WHERE org_id = ? AND ccagent_id = ?",
            )
            .bind(org_id)
            .bind(ccagent_id)
            .execute(ex)
            .await
            .context("failed to touch active agent")?;
        });
        Ok(())
    }

    pub async fn delete(&self, org_id: &str, ccagent_id: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query("DELETE FROM active_agents WHERE org_id = ? AND ccagent_id = ?")
                .bind(org_id)
                .bind(ccagent_id)
                .execute(ex)
                .await
                .context("failed to delete active agent")?;
        });
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ActiveAgent>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, ccagent_id, capacity, last_seen_at, created_at FROM active_agents WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch active agent by id")?
        });

        row.map(agent_from_row).transpose()
    }

    pub async fn get_by_ccagent_id(
        &self,
        org_id: &str,
        ccagent_id: &str,
    ) -> Result<Option<ActiveAgent>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, ccagent_id, capacity, last_seen_at, created_at FROM active_agents WHERE org_id = ? AND ccagent_id = ?",
            )
            .bind(org_id)
            .bind(ccagent_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch active agent")?
        });

        row.map(agent_from_row).transpose()
    }

    /// All registered agents for an org, most recently connected first —
    /// the REST surface's `/orgs/:org_id/agents` listing.
    pub async fn list_for_org(&self, org_id: &str) -> Result<Vec<ActiveAgent>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, ccagent_id, capacity, last_seen_at, created_at FROM active_agents \
                 WHERE org_id = ? ORDER BY created_at DESC",
            )
            .bind(org_id)
            .fetch_all(ex)
            .await
            .context("failed to list agents for org")?
        });

        rows.into_iter().map(agent_from_row).collect()
    }

    /// Agents with headroom under `capacity` (fewer active assignments than
    /// `capacity`), ordered by `created_at` ascending — the longest-connected
    /// idle agent wins, keeping load even and letting new agents warm up
    /// (spec.md §4.3).
    pub async fn list_available(&self, org_id: &str) -> Result<Vec<ActiveAgent>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT a.id, a.org_id, a.ccagent_id, a.capacity, a.last_seen_at, a.created_at \
                 FROM active_agents a \
                 WHERE a.org_id = ? AND a.capacity > ( \
                     SELECT COUNT(*) FROM agent_job_assignments s \
                     WHERE s.agent_id = a.id AND s.status = 'active' \
                 ) \
                 ORDER BY a.created_at ASC",
            )
            .bind(org_id)
            .fetch_all(ex)
            .await
            .context("failed to list available agents")?
        });

        rows.into_iter().map(agent_from_row).collect()
    }

    /// Agents not seen since `threshold`, candidates for the Dispatcher's
    /// inactive-agent-sweep sub-task.
    pub async fn list_inactive(&self, threshold: chrono::Duration) -> Result<Vec<ActiveAgent>> {
        let cutoff = chrono::Utc::now() - threshold;
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, ccagent_id, capacity, last_seen_at, created_at FROM active_agents WHERE last_seen_at < ?",
            )
            .bind(cutoff.naive_utc())
            .fetch_all(ex)
            .await
            .context("failed to list inactive agents")?
        });

        rows.into_iter().map(agent_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::assignments::AssignmentRepo;
    use crate::db::connect_in_memory;
    use crate::db::jobs::JobRepo;
    use crate::ChatPlatform;

    #[tokio::test]
    async fn upsert_active_refreshes_capacity_on_reconnect() {
        let pool = connect_in_memory().await;
        let repo = AgentRepo::new(pool);

        let first = repo.upsert_active("org1", "agent1", 2).await.unwrap();
        let second = repo.upsert_active("org1", "agent1", 5).await.unwrap();

        assert_eq!(first.id, second.id, "reconnecting the same ccagent_id reuses the row");
        assert_eq!(second.capacity, 5);
    }

    #[tokio::test]
    async fn list_available_excludes_agents_at_capacity() {
        let pool = connect_in_memory().await;
        let agents = AgentRepo::new(pool.clone());
        let assignments = AssignmentRepo::new(pool.clone());
        let jobs = JobRepo::new(pool.clone());

        let full = agents.upsert_active("org1", "agent-full", 1).await.unwrap();
        let spare = agents.upsert_active("org1", "agent-spare", 2).await.unwrap();

        let job = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-1")
            .await
            .unwrap();
        assignments.create_active("org1", &job.id, &full.id).await.unwrap();

        let available = agents.list_available("org1").await.unwrap();
        let ids: Vec<_> = available.iter().map(|a| a.id.clone()).collect();

        assert!(!ids.contains(&full.id), "an agent at capacity has no headroom");
        assert!(ids.contains(&spare.id));
    }

    #[tokio::test]
    async fn list_inactive_only_returns_agents_past_threshold() {
        let pool = connect_in_memory().await;
        let repo = AgentRepo::new(pool.clone());
        repo.upsert_active("org1", "agent-fresh", 1).await.unwrap();

        sqlx::query(
            "INSERT INTO active_agents (id, org_id, ccagent_id, capacity, last_seen_at) VALUES ('agt-stale', 'org1', 'agent-stale', 1, datetime('now', '-1 hour'))",
        )
        .execute(&pool)
        .await
        .unwrap();

        let inactive = repo.list_inactive(chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].ccagent_id, "agent-stale");
    }
}

fn agent_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ActiveAgent> {
    Ok(ActiveAgent {
        id: row.try_get("id").context("failed to read agent id")?,
        org_id: row.try_get("org_id").context("failed to read agent org_id")?,
        ccagent_id: row.try_get("ccagent_id").context("failed to read agent ccagent_id")?,
        capacity: row
            .try_get::<i64, _>("capacity")
            .context("failed to read agent capacity")? as u32,
        last_seen_at: row
            .try_get::<chrono::NaiveDateTime, _>("last_seen_at")
            .map(|v| v.and_utc())
            .context("failed to read agent last_seen_at")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read agent created_at")?,
    })
}
