//! HTTP surface: webhook ingress, tenant-scoped REST, and the agent
//! WebSocket endpoint.

mod rest;
mod webhooks;

use crate::channel::{FrameHandler, MessageChannel};
use crate::chat::discord::DiscordAdapter;
use crate::chat::slack::SlackAdapter;
use crate::db::agents::AgentRepo;
use crate::db::jobs::JobRepo;
use crate::db::organizations::OrganizationRepo;

use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared state behind every handler. Built once at the composition root.
pub struct AppState {
    pub organizations: OrganizationRepo,
    pub jobs: JobRepo,
    pub agents: AgentRepo,
    pub channel: MessageChannel,
    pub frame_handler: Arc<dyn FrameHandler>,
    pub slack: Option<Arc<SlackAdapter>>,
    pub slack_signing_secret: Option<String>,
    pub discord: Option<Arc<DiscordAdapter>>,
    pub discord_public_key: Option<String>,
}

/// Start the HTTP server on `bind`, serving until `shutdown_rx` fires.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<AppState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(rest::healthz))
        .route("/webhooks/slack", post(webhooks::handle_slack))
        .route("/webhooks/discord", post(webhooks::handle_discord))
        .route("/agents/connect", get(rest::connect_agent))
        .route("/orgs/{org_id}/jobs", get(rest::list_jobs))
        .route("/orgs/{org_id}/agents", get(rest::list_agents))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}
