//! Job & Message State Machine (spec.md §4.4): the inbound path that turns a
//! chat event into a QUEUED Processed Message, the dispatch step that picks
//! an agent and sends a session frame, and the agent reply path that drives
//! messages to COMPLETED. The Dispatcher (`crate::dispatcher`) is the only
//! caller of `promote_queued`/`demote_job`; everything else runs off the
//! Message Channel's `FrameHandler` callbacks.

use crate::channel::protocol::{AgentFrame, CoordinatorFrame, Usage};
use crate::channel::{FrameHandler, MessageChannel};
use crate::chat::{ChatAdapterManager, InboundChatEvent};
use crate::db::agents::AgentRepo;
use crate::db::assignments::AssignmentRepo;
use crate::db::channels::ChannelRepo;
use crate::db::conversation_cost::ConversationCostRepo;
use crate::db::jobs::JobRepo;
use crate::db::messages::MessageRepo;
use crate::db::users::UserRepo;
use crate::db::TransactionManager;
use crate::error::Result;
use crate::registry::Registry;
use crate::{JobStatus, MessageStatus};

#[derive(Clone)]
pub struct StateMachine {
    tx: TransactionManager,
    jobs: JobRepo,
    messages: MessageRepo,
    assignments: AssignmentRepo,
    agents: AgentRepo,
    users: UserRepo,
    channels: ChannelRepo,
    costs: ConversationCostRepo,
    registry: Registry,
    channel: MessageChannel,
    chat: ChatAdapterManager,
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: TransactionManager,
        jobs: JobRepo,
        messages: MessageRepo,
        assignments: AssignmentRepo,
        agents: AgentRepo,
        users: UserRepo,
        channels: ChannelRepo,
        costs: ConversationCostRepo,
        registry: Registry,
        channel: MessageChannel,
        chat: ChatAdapterManager,
    ) -> Self {
        Self {
            tx,
            jobs,
            messages,
            assignments,
            agents,
            users,
            channels,
            costs,
            registry,
            channel,
            chat,
        }
    }

    /// Inbound path: turn one normalized chat event into a QUEUED Processed
    /// Message, creating the Job/User/Connected Channel rows it needs.
    /// Idempotent on `(job_id, platform_message_id)` (P6) — a webhook retry
    /// of an already-seen event is a silent no-op.
    pub async fn handle_inbound_event(&self, org_id: &str, event: InboundChatEvent) -> Result<()> {
        let org_id = org_id.to_string();
        let created = self
            .tx
            .run(|| async {
                let channel = self
                    .channels
                    .find_or_create(&org_id, event.platform, &event.platform_channel_id)
                    .await?;
                let user = self
                    .users
                    .find_or_create(
                        &org_id,
                        event.platform,
                        &event.user_auth_provider_id,
                        event.user_display_name.as_deref(),
                    )
                    .await?;
                let job = self
                    .jobs
                    .find_or_create(&org_id, &channel.id, event.platform, &event.thread_key)
                    .await?;
                self.messages
                    .create_if_new(&org_id, &job.id, &user.id, &event.platform_message_id, &event.text)
                    .await
            })
            .await?;

        if created.is_some() {
            self.channel.dispatch_notify.notify_waiters();
        }
        Ok(())
    }

    /// Dispatch step, run by the Dispatcher's promote-queued sub-task on
    /// every tick and whenever `dispatch_notify` fires. Returns the number
    /// of jobs advanced this pass.
    pub async fn promote_queued(&self) -> Result<usize> {
        let jobs = self.jobs.list_with_queued_messages().await?;
        let mut promoted = 0;
        for job in jobs {
            if self.promote_one(&job.id).await? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn promote_one(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        let plan = self
            .tx
            .run(|| async {
                let Some(job) = self.jobs.get(&job_id).await? else {
                    return Ok(None);
                };
                if self.messages.in_progress_for_job(&job_id).await?.is_some() {
                    // Another message on this job is already being worked
                    // (P2): wait for it to complete before promoting the next.
                    return Ok(None);
                }
                let Some(message) = self.messages.oldest_queued_for_job(&job_id).await? else {
                    return Ok(None);
                };

                let existing = self.assignments.active_for_job(&job_id).await?;
                let (_assignment_id, agent_ccagent_id, session_id) = match existing {
                    Some(assignment) => {
                        let Some(agent) = self.agents.get(&assignment.agent_id).await? else {
                            return Ok(None);
                        };
                        if !self.channel.connections().is_connected(&agent.ccagent_id) {
                            // Assignment still on record but the socket is
                            // gone; the disconnect handler hasn't caught up
                            // yet. Leave queued for the next tick.
                            return Ok(None);
                        }
                        (assignment.id, agent.ccagent_id, assignment.session_id)
                    }
                    None => {
                        let Some(agent) = self.registry.available(&job.org_id).await?.into_iter().next() else {
                            return Ok(None);
                        };
                        let assignment = self.assignments.create_active(&job.org_id, &job_id, &agent.id).await?;
                        (assignment.id, agent.ccagent_id, None)
                    }
                };

                self.messages
                    .set_status(&message.id, MessageStatus::Queued, MessageStatus::InProgress)
                    .await?;
                self.jobs.set_status(&job_id, job.status, JobStatus::InProgress).await?;

                Ok(Some((job, message, agent_ccagent_id, session_id)))
            })
            .await?;

        let Some((job, message, ccagent_id, session_id)) = plan else {
            return Ok(false);
        };

        let Some(client_id) = self.channel.connections().client_id_for(&job.org_id, &ccagent_id).await else {
            tracing::warn!(job_id = %job.id, ccagent_id, "agent vanished between planning and send, will retry next tick");
            return Ok(true);
        };

        let frame_id = uuid::Uuid::new_v4().to_string();
        let frame = match session_id {
            Some(session_id) => CoordinatorFrame::ContinueSession {
                id: frame_id,
                job_id: job.id.clone(),
                message_id: message.id.clone(),
                session_id,
                prompt: message.body.clone(),
                options: None,
            },
            None => {
                let repo_url = self
                    .channels
                    .get(&job.channel_id)
                    .await?
                    .and_then(|c| c.default_repository_url)
                    .unwrap_or_default();
                CoordinatorFrame::StartSession {
                    id: frame_id,
                    job_id: job.id.clone(),
                    message_id: message.id.clone(),
                    prompt: message.body.clone(),
                    repo_url,
                    options: None,
                }
            }
        };

        if let Err(error) = self.channel.send_reliable(&client_id, &frame).await {
            tracing::warn!(%error, job_id = %job.id, "failed to dispatch session frame, will retry next tick");
        }

        Ok(true)
    }

    /// Agent disconnect/eviction demotion (spec.md §4.4 "Failure semantics",
    /// P7): the job's IN_PROGRESS message, if any, goes back to QUEUED so
    /// the next promote-queued pass re-dispatches it. A no-op if the job has
    /// no IN_PROGRESS message (already handled, or never had one).
    pub async fn demote_job(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.tx
            .run(|| async {
                let Some(message) = self.messages.in_progress_for_job(&job_id).await? else {
                    return Ok(());
                };
                let Some(job) = self.jobs.get(&job_id).await? else {
                    return Ok(());
                };
                self.messages
                    .set_status(&message.id, MessageStatus::InProgress, MessageStatus::Queued)
                    .await?;
                self.jobs.set_status(&job_id, job.status, JobStatus::Queued).await?;
                Ok(())
            })
            .await
    }
}

#[async_trait::async_trait]
impl FrameHandler for StateMachine {
    async fn handle(&self, org_id: &str, ccagent_id: &str, frame: AgentFrame) {
        match frame {
            AgentFrame::Progress { job_id, message_id, text, .. } => {
                self.handle_progress(org_id, &job_id, &message_id, &text).await;
            }
            AgentFrame::Result {
                job_id,
                message_id,
                text,
                session_id,
                pr_url,
                commit_hash,
                usage,
                ..
            } => {
                self.handle_terminal(org_id, &job_id, &message_id, &text, None, session_id, pr_url, commit_hash, usage)
                    .await;
            }
            AgentFrame::Error { job_id, message_id, text, usage, .. } => {
                self.handle_terminal(org_id, &job_id, &message_id, "", Some(text), None, None, None, usage)
                    .await;
            }
            AgentFrame::Pong { .. } => {}
            AgentFrame::Hello { .. } | AgentFrame::Ack { .. } => {
                tracing::warn!(org_id, ccagent_id, "frame should have been intercepted by the channel, ignoring");
            }
        }
    }

    async fn on_disconnect(&self, org_id: &str, ccagent_id: &str, released_job_ids: &[String]) {
        for job_id in released_job_ids {
            if let Err(error) = self.demote_job(job_id).await {
                tracing::warn!(%error, org_id, ccagent_id, %job_id, "failed to demote job after agent disconnect");
            }
        }
        if !released_job_ids.is_empty() {
            self.channel.dispatch_notify.notify_waiters();
        }
    }
}

impl StateMachine {
    async fn handle_progress(&self, org_id: &str, job_id: &str, message_id: &str, text: &str) {
        let Ok(Some(message)) = self.messages.get(message_id).await else {
            return;
        };
        if message.org_id != org_id || message.job_id != job_id {
            tracing::warn!(org_id, message_id, "tenant/job mismatch on progress frame, dropping");
            return;
        }
        let Ok(Some(job)) = self.jobs.get(job_id).await else {
            return;
        };
        let Some(adapter) = self.chat.get(job.platform) else {
            return;
        };

        match &message.posted_reply_id {
            Some(posted_id) => {
                if let Err(error) = adapter.edit_message(posted_id, text).await {
                    tracing::warn!(%error, message_id, "failed to edit progress reply");
                }
            }
            None => match adapter.post_thread_reply(&job.thread_key, text).await {
                Ok(posted_id) => {
                    if let Err(error) = self.messages.set_posted_reply_id(message_id, &posted_id).await {
                        tracing::warn!(%error, message_id, "failed to persist posted_reply_id");
                    }
                }
                Err(error) => tracing::warn!(%error, message_id, "failed to post progress reply"),
            },
        }
    }

    /// `result`/`error` both land here: the message completes either way
    /// (spec.md §7), `error_text` is the only trace of which path it took.
    #[allow(clippy::too_many_arguments)]
    async fn handle_terminal(
        &self,
        org_id: &str,
        job_id: &str,
        message_id: &str,
        text: &str,
        error_text: Option<String>,
        session_id: Option<String>,
        pr_url: Option<String>,
        commit_hash: Option<String>,
        usage: Option<Usage>,
    ) {
        let job_id = job_id.to_string();
        let message_id = message_id.to_string();
        let org_id_owned = org_id.to_string();
        let text = text.to_string();

        let outcome = self
            .tx
            .run(|| async {
                let Some(message) = self.messages.get(&message_id).await? else {
                    return Ok(None);
                };
                if message.org_id != org_id_owned || message.job_id != job_id {
                    tracing::warn!(org_id = %org_id_owned, %message_id, "tenant/job mismatch on terminal frame, dropping");
                    return Ok(None);
                }
                if message.status != MessageStatus::InProgress {
                    // Already completed: duplicate delivery after a retransmit.
                    return Ok(None);
                }

                self.messages
                    .complete(&message_id, MessageStatus::InProgress, error_text.as_deref())
                    .await?;

                if let Some(assignment) = self.assignments.active_for_job(&job_id).await?
                    && let Some(session_id) = &session_id
                {
                    self.assignments.set_session_id(&assignment.id, session_id).await?;
                }

                if let Some(usage) = &usage {
                    self.costs
                        .add(&job_id, usage.prompt_tokens, usage.completion_tokens, usage.cost_micros)
                        .await?;
                }

                let remaining_queued = self.messages.oldest_queued_for_job(&job_id).await?.is_some();
                let Some(job) = self.jobs.get(&job_id).await? else {
                    return Ok(None);
                };
                let next_status = if remaining_queued { JobStatus::Queued } else { JobStatus::Completed };
                self.jobs.set_status(&job_id, job.status, next_status).await?;

                Ok(Some((job, remaining_queued)))
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(%error, %job_id, %message_id, "failed to complete processed message");
                return;
            }
        };

        let Some((job, remaining_queued)) = outcome else {
            return;
        };

        if let Some(adapter) = self.chat.get(job.platform) {
            let reply = format_terminal_reply(&text, error_text.as_deref(), pr_url.as_deref(), commit_hash.as_deref());
            if let Err(error) = adapter.post_thread_reply(&job.thread_key, &reply).await {
                tracing::warn!(%error, %job_id, "failed to post terminal reply; persisted state will be retried on the next tick's post, not automatically");
            }
        }

        if remaining_queued {
            self.channel.dispatch_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::ConnectionSet;
    use crate::chat::InboundChatEvent;
    use crate::config::ChannelConfig;
    use crate::crypto::MasterKey;
    use crate::db::connect_in_memory;
    use crate::db::organizations::OrganizationRepo;
    use crate::ChatPlatform;
    use axum::extract::ws::Message as WsMessage;
    use std::sync::Arc;

    fn inbound_event(platform_message_id: &str, text: &str) -> InboundChatEvent {
        InboundChatEvent {
            platform: ChatPlatform::Slack,
            platform_channel_id: "C123".to_string(),
            thread_key: "thread-1".to_string(),
            platform_message_id: platform_message_id.to_string(),
            text: text.to_string(),
            user_auth_provider_id: "U123".to_string(),
            user_display_name: Some("Ada".to_string()),
        }
    }

    async fn build_statemachine(pool: sqlx::SqlitePool) -> (StateMachine, Registry, MessageChannel) {
        let tx = TransactionManager::new(pool.clone());
        let jobs = JobRepo::new(pool.clone());
        let messages = MessageRepo::new(pool.clone());
        let assignments = AssignmentRepo::new(pool.clone());
        let agents = AgentRepo::new(pool.clone());
        let users = UserRepo::new(pool.clone());
        let channels = ChannelRepo::new(pool.clone());
        let costs = ConversationCostRepo::new(pool.clone());
        let connections = Arc::new(ConnectionSet::new());
        let registry = Registry::new(agents.clone(), assignments.clone(), connections);
        let organizations = OrganizationRepo::new(pool.clone());
        let channel = MessageChannel::new(registry.clone(), organizations, MasterKey::from_bytes(&[0u8; 32]), ChannelConfig::default());
        let chat = ChatAdapterManager::new();

        let statemachine = StateMachine::new(
            tx,
            jobs,
            messages,
            assignments,
            agents,
            users,
            channels,
            costs,
            registry.clone(),
            channel.clone(),
            chat,
        );

        (statemachine, registry, channel)
    }

    #[tokio::test]
    async fn handle_inbound_event_is_idempotent_on_platform_message_id() {
        let pool = connect_in_memory().await;
        let (statemachine, _registry, _channel) = build_statemachine(pool.clone()).await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();
        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1, "a duplicate webhook delivery must not create a second message (P6)");
    }

    #[tokio::test]
    async fn handle_inbound_event_creates_one_queued_job_and_message() {
        let pool = connect_in_memory().await;
        let (statemachine, _registry, _channel) = build_statemachine(pool.clone()).await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();

        let job_status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(job_status, "queued");

        let message_status: String = sqlx::query_scalar("SELECT status FROM processed_messages WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(message_status, "queued");
    }

    #[tokio::test]
    async fn promote_queued_dispatches_to_an_available_agent() {
        let pool = connect_in_memory().await;
        let (statemachine, registry, channel) = build_statemachine(pool.clone()).await;

        registry.upsert_active("org1", "agent1", 1).await.unwrap();
        let (sender, _receiver) = tokio::sync::mpsc::channel::<WsMessage>(8);
        channel
            .connections()
            .register("client1".to_string(), "org1".to_string(), "agent1".to_string(), sender)
            .await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();

        let promoted = statemachine.promote_queued().await.unwrap();
        assert_eq!(promoted, 1);

        let job_status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(job_status, "in_progress");

        let message_status: String = sqlx::query_scalar("SELECT status FROM processed_messages WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(message_status, "in_progress");

        let assignment_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_job_assignments WHERE status = 'active'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(assignment_count, 1);
    }

    #[tokio::test]
    async fn promote_queued_does_not_promote_a_second_message_while_one_is_in_progress() {
        let pool = connect_in_memory().await;
        let (statemachine, registry, channel) = build_statemachine(pool.clone()).await;

        registry.upsert_active("org1", "agent1", 1).await.unwrap();
        let (sender, _receiver) = tokio::sync::mpsc::channel::<WsMessage>(8);
        channel
            .connections()
            .register("client1".to_string(), "org1".to_string(), "agent1".to_string(), sender)
            .await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "first")).await.unwrap();
        statemachine.promote_queued().await.unwrap();

        statemachine.handle_inbound_event("org1", inbound_event("p2", "second")).await.unwrap();
        let promoted = statemachine.promote_queued().await.unwrap();
        assert_eq!(promoted, 0, "a second message must not advance while the first is still in_progress (P2)");

        let in_progress_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages WHERE status = 'in_progress'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(in_progress_count, 1);

        let queued_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages WHERE status = 'queued'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(queued_count, 1);
    }

    #[tokio::test]
    async fn demote_job_returns_in_progress_message_to_queued() {
        let pool = connect_in_memory().await;
        let (statemachine, _registry, _channel) = build_statemachine(pool.clone()).await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();
        let job_id: String = sqlx::query_scalar("SELECT id FROM jobs WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let message_id: String = sqlx::query_scalar("SELECT id FROM processed_messages WHERE job_id = ?")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();

        sqlx::query("UPDATE processed_messages SET status = 'in_progress' WHERE id = ?")
            .bind(&message_id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET status = 'in_progress' WHERE id = ?")
            .bind(&job_id)
            .execute(&pool)
            .await
            .unwrap();

        statemachine.demote_job(&job_id).await.unwrap();

        let message_status: String = sqlx::query_scalar("SELECT status FROM processed_messages WHERE id = ?")
            .bind(&message_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let job_status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(message_status, "queued");
        assert_eq!(job_status, "queued");
    }

    #[tokio::test]
    async fn demote_job_is_a_noop_without_an_in_progress_message() {
        let pool = connect_in_memory().await;
        let (statemachine, _registry, _channel) = build_statemachine(pool.clone()).await;

        statemachine.handle_inbound_event("org1", inbound_event("p1", "hello")).await.unwrap();
        let job_id: String = sqlx::query_scalar("SELECT id FROM jobs WHERE org_id = 'org1'")
            .fetch_one(&pool)
            .await
            .unwrap();

        // The message is still QUEUED, never IN_PROGRESS; demotion must leave
        // the job untouched.
        statemachine.demote_job(&job_id).await.unwrap();

        let job_status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(job_status, "queued");
    }
}

fn format_terminal_reply(text: &str, error_text: Option<&str>, pr_url: Option<&str>, commit_hash: Option<&str>) -> String {
    if let Some(error_text) = error_text {
        return format!(":x: {error_text}");
    }

    let mut reply = text.to_string();
    if let Some(pr_url) = pr_url {
        reply.push_str(&format!("\n\n{pr_url}"));
    }
    if let Some(commit_hash) = commit_hash {
        reply.push_str(&format!(" ({commit_hash})"));
    }
    reply
}
