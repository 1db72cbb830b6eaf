//! Message Channel: one bidirectional connection per agent, with
//! reliable (at-least-once) delivery in the coordinator-to-agent direction.

pub mod pending;
pub mod protocol;
pub mod transport;

use crate::channel::pending::PendingMap;
use crate::channel::protocol::{decode_agent_frame, encode_coordinator_frame, AgentFrame, CoordinatorFrame};
use crate::channel::transport::ConnectionSet;
use crate::config::ChannelConfig;
use crate::crypto::MasterKey;
use crate::db::organizations::OrganizationRepo;
use crate::error::{ChannelError, ProtocolError, Result};
use crate::registry::Registry;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Invoked with every decoded, non-`ack`/`hello` frame from an authenticated
/// connection, one at a time per connection (spec.md §4.2's per-connection
/// FIFO handler contract).
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, org_id: &str, ccagent_id: &str, frame: AgentFrame);

    /// Called once the disconnected agent's assignments have already been
    /// released in the store; `released_job_ids` names every job that lost
    /// its assignment so the handler can demote their IN_PROGRESS message
    /// back to QUEUED and re-trigger dispatch (spec.md §4.4 "Failure
    /// semantics").
    async fn on_disconnect(&self, org_id: &str, ccagent_id: &str, released_job_ids: &[String]);
}

#[derive(Clone)]
pub struct MessageChannel {
    pending: Arc<PendingMap>,
    connections: Arc<ConnectionSet>,
    registry: Registry,
    organizations: OrganizationRepo,
    master_key: MasterKey,
    config: ChannelConfig,
    /// Signalled whenever a job may have become dispatchable (new message,
    /// new agent connect, ACK of an assignment) so the Dispatcher's
    /// promote-queued sub-task doesn't wait a full tick.
    pub dispatch_notify: Arc<Notify>,
}

impl MessageChannel {
    pub fn new(
        registry: Registry,
        organizations: OrganizationRepo,
        master_key: MasterKey,
        config: ChannelConfig,
    ) -> Self {
        Self {
            pending: Arc::new(PendingMap::new(config.ack_timeout, config.max_retries)),
            connections: Arc::new(ConnectionSet::new()),
            registry,
            organizations,
            master_key,
            config,
            dispatch_notify: Arc::new(Notify::new()),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        self.connections.clone()
    }

    /// Buffer `payload` for `client_id` and send it now; retransmitted by
    /// the retry sweep until ACK'd or `MAX_RETRIES` is exhausted.
    pub async fn send_reliable(&self, client_id: &str, frame: &CoordinatorFrame) -> Result<()> {
        let payload = encode_coordinator_frame(frame);
        let message_id = frame.id().to_string();

        self.pending
            .insert(message_id, client_id.to_string(), payload.clone())
            .await;

        self.write_to(client_id, payload).await
    }

    pub async fn acknowledge(&self, message_id: &str) -> bool {
        self.pending.acknowledge(message_id).await
    }

    async fn write_to(&self, client_id: &str, payload: String) -> Result<()> {
        let Some(sender) = self.connections.sender_for_client(client_id).await else {
            return Err(ChannelError::NotConnected {
                ccagent_id: client_id.to_string(),
            }
            .into());
        };

        sender
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|e| ChannelError::SendFailed {
                client_id: client_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    /// Background task scanning the pending map every `retry_scan_interval`
    /// and retransmitting due entries. Never holds the pending map's lock
    /// across the socket write.
    pub fn spawn_retry_sweep(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(channel.config.retry_scan_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let due = channel.pending.due_for_retry(Instant::now()).await;
                for entry in due {
                    if !channel
                        .pending
                        .record_attempt(&entry.message_id, Instant::now())
                        .await
                    {
                        tracing::warn!(
                            message_id = %entry.message_id,
                            client_id = %entry.client_id,
                            "dropping message after exhausting retries"
                        );
                        continue;
                    }

                    if let Err(error) = channel.write_to(&entry.client_id, entry.payload).await {
                        tracing::debug!(%error, client_id = %entry.client_id, "retransmit failed, will retry");
                    }
                }
            }
        })
    }

    /// Accept an upgraded WebSocket as a new agent connection: authenticate
    /// the `hello` handshake, register with the Agent Registry and
    /// connection set, then read frames until disconnect.
    pub async fn accept(&self, socket: WebSocket, handler: Arc<dyn FrameHandler>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (mut stream, sender, writer) = transport::spawn_writer(socket);

        use futures::StreamExt as _;

        let first = stream.next().await;
        let (org_id, ccagent_id, capacity) = match self.authenticate(first).await {
            Ok(identity) => identity,
            Err(error) => {
                tracing::warn!(%error, client_id, "agent handshake failed");
                let _ = sender
                    .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                        code: 4401,
                        reason: "authentication failed".into(),
                    })))
                    .await;
                drop(sender);
                let _ = writer.await;
                return;
            }
        };

        if let Err(error) = self.registry.upsert_active(&org_id, &ccagent_id, capacity).await {
            tracing::error!(%error, org_id, ccagent_id, "failed to register agent");
            drop(sender);
            let _ = writer.await;
            return;
        }

        self.connections
            .register(client_id.clone(), org_id.clone(), ccagent_id.clone(), sender)
            .await;
        tracing::info!(client_id, org_id, ccagent_id, "agent connected");
        self.dispatch_notify.notify_waiters();

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    self.handle_inbound(&org_id, &ccagent_id, text.as_str(), handler.as_ref())
                        .await;
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(error) => {
                    tracing::debug!(%error, client_id, "websocket read error");
                    break;
                }
            }
        }

        self.connections.remove(&client_id).await;
        self.pending.purge_for_client(&client_id).await;
        let released_job_ids = match self.registry.deregister(&org_id, &ccagent_id).await {
            Ok(job_ids) => job_ids,
            Err(error) => {
                tracing::error!(%error, org_id, ccagent_id, "failed to deregister agent on disconnect");
                Vec::new()
            }
        };
        tracing::info!(client_id, org_id, ccagent_id, "agent disconnected");
        handler.on_disconnect(&org_id, &ccagent_id, &released_job_ids).await;
        self.dispatch_notify.notify_waiters();

        let _ = writer.await;
    }

    async fn handle_inbound(&self, org_id: &str, ccagent_id: &str, text: &str, handler: &dyn FrameHandler) {
        let frame = match decode_agent_frame(text, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, org_id, ccagent_id, "protocol violation, closing connection");
                return;
            }
        };

        if let Err(error) = self.registry.touch(org_id, ccagent_id).await {
            tracing::warn!(%error, org_id, ccagent_id, "failed to touch agent presence");
        }

        match &frame {
            AgentFrame::Ack { id } => {
                self.acknowledge(id).await;
            }
            AgentFrame::Hello { .. } => {
                tracing::warn!(org_id, ccagent_id, "unexpected repeat hello frame, ignoring");
            }
            _ => {
                handler.handle(org_id, ccagent_id, frame).await;
            }
        }
    }

    async fn authenticate(
        &self,
        first: Option<std::result::Result<WsMessage, axum::Error>>,
    ) -> Result<(String, String, u32)> {
        let text = match first {
            Some(Ok(WsMessage::Text(text))) => text,
            _ => return Err(ProtocolError::MissingHello.into()),
        };

        let frame = decode_agent_frame(&text, self.config.max_frame_bytes)
            .map_err(|_| ProtocolError::MissingHello)?;

        let AgentFrame::Hello {
            ccagent_id,
            org_secret,
            capacity,
            ..
        } = frame
        else {
            return Err(ProtocolError::MissingHello.into());
        };

        // The org is not known from the frame alone in a multi-tenant
        // deployment behind one shared endpoint; resolve it by scanning the
        // (typically small) organizations table for the one whose decrypted
        // secret matches. spec.md's hello frame carries only `ccagent_id`
        // and `org_secret`, not an org hint.
        let org_id = self
            .organizations
            .find_by_agent_secret(&self.master_key, &org_secret)
            .await?
            .ok_or(ProtocolError::AuthMismatch {
                ccagent_id: ccagent_id.clone(),
            })?;

        Ok((org_id, ccagent_id, capacity))
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel").finish_non_exhaustive()
    }
}
