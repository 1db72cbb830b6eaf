//! Live connection registry and the axum WebSocket upgrade handler.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

struct ConnectionHandle {
    org_id: String,
    ccagent_id: String,
    sender: mpsc::Sender<WsMessage>,
}

/// The Message Channel's live connection set: `client_id` (an ephemeral
/// per-socket id) to outbound sender, plus a `(org_id, ccagent_id)` index
/// for registry lookups. Guarded by a single `RwLock` with short critical
/// sections — no socket I/O ever happens while holding it.
pub struct ConnectionSet {
    by_client: RwLock<HashMap<String, ConnectionHandle>>,
    by_agent: RwLock<HashMap<(String, String), String>>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            by_client: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        client_id: String,
        org_id: String,
        ccagent_id: String,
        sender: mpsc::Sender<WsMessage>,
    ) {
        self.by_agent
            .write()
            .await
            .insert((org_id.clone(), ccagent_id.clone()), client_id.clone());
        self.by_client.write().await.insert(
            client_id,
            ConnectionHandle {
                org_id,
                ccagent_id,
                sender,
            },
        );
    }

    pub async fn remove(&self, client_id: &str) {
        if let Some(handle) = self.by_client.write().await.remove(client_id) {
            let mut by_agent = self.by_agent.write().await;
            if by_agent
                .get(&(handle.org_id.clone(), handle.ccagent_id.clone()))
                .map(|current| current == client_id)
                .unwrap_or(false)
            {
                by_agent.remove(&(handle.org_id, handle.ccagent_id));
            }
        }
    }

    pub async fn sender_for_client(&self, client_id: &str) -> Option<mpsc::Sender<WsMessage>> {
        self.by_client
            .read()
            .await
            .get(client_id)
            .map(|handle| handle.sender.clone())
    }

    pub async fn client_id_for(&self, org_id: &str, ccagent_id: &str) -> Option<String> {
        self.by_agent
            .read()
            .await
            .get(&(org_id.to_string(), ccagent_id.to_string()))
            .cloned()
    }

    /// Best-effort "is this ccagent_id connected in some org" check, used by
    /// the Agent Registry's `Available` query which already filters by org
    /// upstream. `ccagent_id` is only unique within an org, so this assumes
    /// the caller has already scoped candidates to one tenant.
    pub fn is_connected(&self, ccagent_id: &str) -> bool {
        // A synchronous, best-effort check via try_read avoids forcing every
        // registry query (a hot repository read path) to become async-over-
        // async; a momentary lock contention just treats the agent as
        // unavailable for this tick, which is safe — the next tick retries.
        self.by_agent
            .try_read()
            .map(|by_agent| by_agent.keys().any(|(_, id)| id == ccagent_id))
            .unwrap_or(false)
    }
}

/// Split an accepted socket into a read half (returned to the caller's read
/// loop) and a write half drained by a spawned task fed through the returned
/// sender. Keeping the writer on its own task means a slow agent stalls only
/// its own outbound queue, never the reader or another connection.
pub fn spawn_writer(
    socket: WebSocket,
) -> (
    futures::stream::SplitStream<WebSocket>,
    mpsc::Sender<WsMessage>,
    tokio::task::JoinHandle<()>,
) {
    use futures::{SinkExt as _, StreamExt as _};

    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(64);

    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    (stream, tx, handle)
}
