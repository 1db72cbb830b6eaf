//! Tenant-scoped REST endpoints, the agent WebSocket upgrade, and `/healthz`.

use super::AppState;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(super) async fn healthz() -> &'static str {
    "ok"
}

/// Upgrade to a WebSocket and hand the connection to the Message Channel.
/// Per-agent authentication happens inside `MessageChannel::accept` via the
/// `hello` handshake, not here — the upgrade itself is unauthenticated.
pub(super) async fn connect_agent(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.channel.accept(socket, state.frame_handler.clone()).await;
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Serialize)]
pub(super) struct JobView {
    id: String,
    channel_id: String,
    platform: &'static str,
    thread_key: String,
    status: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<crate::Job> for JobView {
    fn from(job: crate::Job) -> Self {
        Self {
            id: job.id,
            channel_id: job.channel_id,
            platform: job.platform.as_str(),
            thread_key: job.thread_key,
            status: job.status.as_str(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Tenant-isolation rule (spec.md §3): a missing/mismatched `org_id` is a
/// 400, never an empty 200 that could be mistaken for "no rows yet".
async fn require_org(state: &AppState, org_id: &str) -> Result<(), StatusCode> {
    let exists = state.organizations.get(org_id).await.map_err(|error| {
        tracing::warn!(%error, org_id, "failed to look up organization");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    exists.map(|_| ()).ok_or(StatusCode::BAD_REQUEST)
}

pub(super) async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobView>>, StatusCode> {
    require_org(&state, &org_id).await?;

    let jobs = state.jobs.list_for_org(&org_id, query.limit).await.map_err(|error| {
        tracing::warn!(%error, org_id, "failed to list jobs");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

#[derive(Serialize)]
pub(super) struct AgentView {
    id: String,
    ccagent_id: String,
    capacity: u32,
    last_seen_at: chrono::DateTime<chrono::Utc>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<crate::ActiveAgent> for AgentView {
    fn from(agent: crate::ActiveAgent) -> Self {
        Self {
            id: agent.id,
            ccagent_id: agent.ccagent_id,
            capacity: agent.capacity,
            last_seen_at: agent.last_seen_at,
            created_at: agent.created_at,
        }
    }
}


pub(super) async fn list_agents(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
) -> Result<Json<Vec<AgentView>>, StatusCode> {
    require_org(&state, &org_id).await?;

    let agents = state.agents.list_for_org(&org_id).await.map_err(|error| {
        tracing::warn!(%error, org_id, "failed to list agents");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}
