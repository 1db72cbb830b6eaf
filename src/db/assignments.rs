//! Agent-Job Assignment repository. Uniqueness on `(agent_id, job_id)`
//! among `active` rows only — a released assignment may be re-created.

use crate::db::tx::Exec;
use crate::error::{DispatchError, Result};
use crate::with_exec;
use crate::{ids, AgentJobAssignment};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone)]
pub struct AssignmentRepo {
    pool: SqlitePool,
}

impl AssignmentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_active(
        &self,
        org_id: &str,
        job_id: &str,
        agent_id: &str,
    ) -> Result<AgentJobAssignment> {
        let id = ids::generate("asg");
        let insert = with_exec!(self, |ex| {
            sqlx::query(
                "INSERT INTO agent_job_assignments (id, org_id, job_id, agent_id, status) VALUES (?, ?, ?, ?, 'active')",
            )
            .bind(&id)
            .bind(org_id)
            .bind(job_id)
            .bind(agent_id)
            .execute(ex)
            .await
        });

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_error)) if db_error.is_unique_violation() => {
                return Err(DispatchError::AlreadyAssigned {
                    job_id: job_id.to_string(),
                    agent_id: agent_id.to_string(),
                }
                .into());
            }
            Err(error) => return Err(anyhow::anyhow!("failed to insert assignment: {error}").into()),
        }

        self.get(&id)
            .await?
            .context("assignment inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentJobAssignment>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, job_id, agent_id, status, session_id, created_at, released_at FROM agent_job_assignments WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch assignment")?
        });

        row.map(assignment_from_row).transpose()
    }

    pub async fn active_for_job(&self, job_id: &str) -> Result<Option<AgentJobAssignment>> {
        let row = with_exec!(self, |ex| {
            sqlx::query(
                "SELECT id, org_id, job_id, agent_id, status, session_id, created_at, released_at FROM agent_job_assignments WHERE job_id = ? AND status = 'active'",
            )
            .bind(job_id)
            .fetch_optional(ex)
            .await
            .context("failed to fetch active assignment for job")?
        });

        row.map(assignment_from_row).transpose()
    }

    /// Record the agent's session identity once known, so the next message
    /// on this job is dispatched as `continue_session` rather than a fresh
    /// `start_session`.
    pub async fn set_session_id(&self, id: &str, session_id: &str) -> Result<()> {
        with_exec!(self, |ex| {
            sqlx::query("UPDATE agent_job_assignments SET session_id = ? WHERE id = ?")
                .bind(session_id)
                .bind(id)
                .execute(ex)
                .await
                .context("failed to set assignment session_id")?;
        });
        Ok(())
    }

    pub async fn release(&self, id: &str) -> Result<()> {
        let result = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE agent_job_assignments SET status = 'released', released_at = datetime('now') WHERE id = ? AND status = 'active'",
            )
            .bind(id)
            .execute(ex)
            .await
            .context("failed to release assignment")?
        });

        if result.rows_affected() == 0 {
            return Err(DispatchError::NoAssignment {
                job_id: id.to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Release every active assignment held by `agent_id`, returning the
    /// `job_id` of each — the caller (the Agent Registry, on disconnect or
    /// eviction) uses these to drive the demotion path (spec.md §4.4
    /// "Failure semantics").
    pub async fn release_all_for_agent(&self, agent_id: &str) -> Result<Vec<String>> {
        let rows = with_exec!(self, |ex| {
            sqlx::query(
                "UPDATE agent_job_assignments SET status = 'released', released_at = datetime('now') WHERE agent_id = ? AND status = 'active' RETURNING job_id",
            )
            .bind(agent_id)
            .fetch_all(ex)
            .await
            .context("failed to release assignments for agent")?
        });

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("job_id").context("failed to read released assignment job_id").map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::agents::AgentRepo;
    use crate::db::connect_in_memory;
    use crate::db::jobs::JobRepo;
    use crate::ChatPlatform;

    #[tokio::test]
    async fn create_active_rejects_a_second_concurrent_assignment() {
        let pool = connect_in_memory().await;
        let jobs = JobRepo::new(pool.clone());
        let agents = AgentRepo::new(pool.clone());
        let repo = AssignmentRepo::new(pool);

        let job = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-1")
            .await
            .unwrap();
        let agent = agents.upsert_active("org1", "agent1", 1).await.unwrap();

        repo.create_active("org1", &job.id, &agent.id).await.unwrap();
        let second = repo.create_active("org1", &job.id, &agent.id).await;

        assert!(second.is_err(), "a second active assignment for the same (agent, job) must be rejected");
    }

    #[tokio::test]
    async fn release_all_for_agent_returns_only_its_own_jobs() {
        let pool = connect_in_memory().await;
        let jobs = JobRepo::new(pool.clone());
        let agents = AgentRepo::new(pool.clone());
        let repo = AssignmentRepo::new(pool);

        let job_a = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-a")
            .await
            .unwrap();
        let job_b = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-b")
            .await
            .unwrap();
        let agent = agents.upsert_active("org1", "agent1", 2).await.unwrap();
        let other_agent = agents.upsert_active("org1", "agent2", 2).await.unwrap();

        repo.create_active("org1", &job_a.id, &agent.id).await.unwrap();
        repo.create_active("org1", &job_b.id, &agent.id).await.unwrap();
        let unrelated_job = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-c")
            .await
            .unwrap();
        repo.create_active("org1", &unrelated_job.id, &other_agent.id).await.unwrap();

        let mut released = repo.release_all_for_agent(&agent.id).await.unwrap();
        released.sort();
        let mut expected = vec![job_a.id, job_b.id];
        expected.sort();
        assert_eq!(released, expected);

        assert!(repo.active_for_job(&unrelated_job.id).await.unwrap().is_some());
    }
}

fn assignment_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AgentJobAssignment> {
    let status_value: String = row.try_get("status").context("failed to read assignment status")?;

    Ok(AgentJobAssignment {
        id: row.try_get("id").context("failed to read assignment id")?,
        org_id: row.try_get("org_id").context("failed to read assignment org_id")?,
        job_id: row.try_get("job_id").context("failed to read assignment job_id")?,
        agent_id: row.try_get("agent_id").context("failed to read assignment agent_id")?,
        status: status_value
            .parse()
            .map_err(|e: DispatchError| anyhow::anyhow!(e.to_string()))?,
        session_id: row.try_get("session_id").ok(),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read assignment created_at")?,
        released_at: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("released_at")
            .ok()
            .flatten()
            .map(|v| v.and_utc()),
    })
}
