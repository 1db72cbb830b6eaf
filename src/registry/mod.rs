//! Agent Registry: who is connected, who has headroom, who has gone quiet.
//!
//! Backed by the `active_agents`/`agent_job_assignments` tables plus the
//! Message Channel's live connection set — an agent row can outlive its
//! socket (e.g. a brief reconnect gap), so "available" means both
//! DB-registered *and* presently connected.

use crate::channel::transport::ConnectionSet;
use crate::db::agents::AgentRepo;
use crate::db::assignments::AssignmentRepo;
use crate::error::Result;
use crate::ActiveAgent;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Registry {
    agents: AgentRepo,
    assignments: AssignmentRepo,
    connections: Arc<ConnectionSet>,
}

impl Registry {
    pub fn new(agents: AgentRepo, assignments: AssignmentRepo, connections: Arc<ConnectionSet>) -> Self {
        Self {
            agents,
            assignments,
            connections,
        }
    }

    /// Record a successful `hello` handshake.
    pub async fn upsert_active(&self, org_id: &str, ccagent_id: &str, capacity: u32) -> Result<ActiveAgent> {
        self.agents.upsert_active(org_id, ccagent_id, capacity).await
    }

    /// Refresh presence on any inbound frame from an agent (not only `ping`).
    pub async fn touch(&self, org_id: &str, ccagent_id: &str) -> Result<()> {
        self.agents.touch(org_id, ccagent_id).await
    }

    /// Remove an agent's registration and release its assignments. Called on
    /// disconnect and by the inactive-agent-sweep sub-task. Returns the
    /// `job_id` of every assignment released, so the caller can demote each
    /// job's IN_PROGRESS message back to QUEUED (spec.md §4.4).
    pub async fn deregister(&self, org_id: &str, ccagent_id: &str) -> Result<Vec<String>> {
        let released_job_ids = match self.agents.get_by_ccagent_id(org_id, ccagent_id).await? {
            Some(agent) => self.assignments.release_all_for_agent(&agent.id).await?,
            None => Vec::new(),
        };
        self.agents.delete(org_id, ccagent_id).await?;
        Ok(released_job_ids)
    }

    /// Agents with spare capacity, live connections only.
    pub async fn available(&self, org_id: &str) -> Result<Vec<ActiveAgent>> {
        let candidates = self.agents.list_available(org_id).await?;
        Ok(candidates
            .into_iter()
            .filter(|agent| self.connections.is_connected(&agent.ccagent_id))
            .collect())
    }

    /// Agents not seen within `threshold`, whether or not still connected —
    /// a connection that stopped answering `ping` counts as inactive.
    pub async fn inactive(&self, threshold: Duration) -> Result<Vec<ActiveAgent>> {
        self.agents
            .list_inactive(chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::jobs::JobRepo;
    use crate::ChatPlatform;
    use axum::extract::ws::Message as WsMessage;

    async fn registry_with_connections(pool: sqlx::SqlitePool) -> (Registry, Arc<ConnectionSet>) {
        let connections = Arc::new(ConnectionSet::new());
        let registry = Registry::new(AgentRepo::new(pool.clone()), AssignmentRepo::new(pool), connections.clone());
        (registry, connections)
    }

    #[tokio::test]
    async fn available_excludes_agents_with_no_live_connection() {
        let pool = connect_in_memory().await;
        let (registry, connections) = registry_with_connections(pool).await;

        registry.upsert_active("org1", "agent-offline", 1).await.unwrap();
        let connected = registry.upsert_active("org1", "agent-online", 1).await.unwrap();

        let (tx, _rx) = tokio::sync::mpsc::channel::<WsMessage>(4);
        connections
            .register("client1".to_string(), "org1".to_string(), "agent-online".to_string(), tx)
            .await;

        let available = registry.available("org1").await.unwrap();
        let ids: Vec<_> = available.iter().map(|a| a.id.clone()).collect();

        assert_eq!(ids, vec![connected.id], "a DB-registered agent with no live socket is not available");
    }

    #[tokio::test]
    async fn deregister_releases_assignments_and_returns_their_job_ids() {
        let pool = connect_in_memory().await;
        let (registry, _connections) = registry_with_connections(pool.clone()).await;
        let jobs = JobRepo::new(pool);

        let agent = registry.upsert_active("org1", "agent1", 1).await.unwrap();
        let job = jobs
            .find_or_create("org1", "chn1", ChatPlatform::Slack, "thread-1")
            .await
            .unwrap();
        registry.assignments.create_active("org1", &job.id, &agent.id).await.unwrap();

        let released = registry.deregister("org1", "agent1").await.unwrap();
        assert_eq!(released, vec![job.id]);

        assert!(registry.agents.get_by_ccagent_id("org1", "agent1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deregister_unknown_agent_is_a_noop() {
        let pool = connect_in_memory().await;
        let (registry, _connections) = registry_with_connections(pool).await;

        let released = registry.deregister("org1", "ghost").await.unwrap();
        assert!(released.is_empty());
    }
}
