//! End-to-end scenarios from the coordinator's testable-properties list:
//! inbound chat event -> queued message -> dispatch -> agent reply -> chat
//! reply, plus queueing, parallelism, crash recovery, and idle cleanup.
//!
//! Runs against a real file-backed SQLite database (foreign keys enforced,
//! unlike the in-memory pool the unit tests use) with a simulated agent
//! socket: a real `mpsc` channel whose frames are decoded and asserted
//! exactly like a real agent would see them.

use axum::extract::ws::Message as WsMessage;
use dispatchd::channel::protocol::{AgentFrame, CoordinatorFrame, Usage};
use dispatchd::channel::transport::ConnectionSet;
use dispatchd::channel::{FrameHandler, MessageChannel};
use dispatchd::chat::{ChatAdapter, ChatAdapterManager, InboundChatEvent, InboundEventStream};
use dispatchd::config::ChannelConfig;
use dispatchd::crypto::MasterKey;
use dispatchd::db::agents::AgentRepo;
use dispatchd::db::assignments::AssignmentRepo;
use dispatchd::db::channels::ChannelRepo;
use dispatchd::db::conversation_cost::ConversationCostRepo;
use dispatchd::db::jobs::JobRepo;
use dispatchd::db::messages::MessageRepo;
use dispatchd::db::organizations::OrganizationRepo;
use dispatchd::db::users::UserRepo;
use dispatchd::db::TransactionManager;
use dispatchd::registry::Registry;
use dispatchd::statemachine::StateMachine;
use dispatchd::ChatPlatform;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Captures every reply a test posts through it, so assertions can check
/// what the chat thread would actually have shown a user.
#[derive(Clone, Default)]
struct RecordingChatAdapter {
    replies: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingChatAdapter {
    fn replies(&self) -> Vec<(String, String)> {
        self.replies.lock().unwrap().clone()
    }
}

impl ChatAdapter for RecordingChatAdapter {
    fn platform(&self) -> ChatPlatform {
        ChatPlatform::Slack
    }

    async fn start(&self) -> dispatchd::Result<InboundEventStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn post_thread_reply(&self, thread_key: &str, text: &str) -> dispatchd::Result<String> {
        self.replies.lock().unwrap().push((thread_key.to_string(), text.to_string()));
        Ok(format!("reply-{}", self.replies.lock().unwrap().len()))
    }

    async fn edit_message(&self, _posted_id: &str, _text: &str) -> dispatchd::Result<()> {
        Ok(())
    }
}

struct Harness {
    statemachine: StateMachine,
    registry: Registry,
    channel: MessageChannel,
    jobs: JobRepo,
    messages: MessageRepo,
    chat: RecordingChatAdapter,
    org_id: String,
    pool: sqlx::SqlitePool,
    _tempdir: tempfile::TempDir,
}

async fn build_harness() -> Harness {
    let tempdir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = tempdir.path().join("dispatchd.db");
    let pool = dispatchd::db::connect(&db_path).await.expect("failed to open database");

    let master_key = MasterKey::from_bytes(&[3u8; 32]);
    let organizations = OrganizationRepo::new(pool.clone());
    let (ciphertext, nonce) = master_key.encrypt(b"agent-secret").unwrap();
    let org = organizations.create("acme", ciphertext, nonce).await.unwrap();

    let jobs = JobRepo::new(pool.clone());
    let messages = MessageRepo::new(pool.clone());
    let assignments = AssignmentRepo::new(pool.clone());
    let agents = AgentRepo::new(pool.clone());
    let users = UserRepo::new(pool.clone());
    let channels = ChannelRepo::new(pool.clone());
    let costs = ConversationCostRepo::new(pool.clone());
    let connections = Arc::new(ConnectionSet::new());
    let registry = Registry::new(agents.clone(), assignments.clone(), connections);
    let channel = MessageChannel::new(
        registry.clone(),
        organizations,
        master_key,
        ChannelConfig {
            ack_timeout: Duration::from_millis(50),
            max_retries: 2,
            retry_scan_interval: Duration::from_millis(20),
            max_frame_bytes: 1024 * 1024,
        },
    );

    let chat_adapter = RecordingChatAdapter::default();
    let mut chat = ChatAdapterManager::new();
    chat.register(Arc::new(chat_adapter.clone()));

    let statemachine = StateMachine::new(
        TransactionManager::new(pool.clone()),
        jobs.clone(),
        messages.clone(),
        assignments,
        agents,
        users,
        channels,
        costs,
        registry.clone(),
        channel.clone(),
        chat,
    );

    Harness {
        statemachine,
        registry,
        channel,
        jobs,
        messages,
        chat: chat_adapter,
        org_id: org.id,
        pool,
        _tempdir: tempdir,
    }
}

fn inbound_event(thread_key: &str, platform_message_id: &str, text: &str) -> InboundChatEvent {
    InboundChatEvent {
        platform: ChatPlatform::Slack,
        platform_channel_id: "C1".to_string(),
        thread_key: thread_key.to_string(),
        platform_message_id: platform_message_id.to_string(),
        text: text.to_string(),
        user_auth_provider_id: "U1".to_string(),
        user_display_name: Some("Ada".to_string()),
    }
}

/// Connects a fake agent: registers it with the registry and the live
/// connection set, returning the receiver a real agent socket would read
/// frames from.
async fn connect_agent(harness: &Harness, ccagent_id: &str) -> mpsc::Receiver<WsMessage> {
    harness.registry.upsert_active(&harness.org_id, ccagent_id, 1).await.unwrap();
    let (sender, receiver) = mpsc::channel(8);
    harness
        .channel
        .connections()
        .register(uuid::Uuid::new_v4().to_string(), harness.org_id.clone(), ccagent_id.to_string(), sender)
        .await;
    receiver
}

async fn recv_coordinator_frame(receiver: &mut mpsc::Receiver<WsMessage>) -> CoordinatorFrame {
    match tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed before a frame arrived")
    {
        WsMessage::Text(text) => serde_json::from_str(text.as_str()).expect("frame should decode"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn s1_happy_path_single_agent() {
    let harness = build_harness().await;
    let mut agent1 = connect_agent(&harness, "agent-1").await;

    harness
        .statemachine
        .handle_inbound_event(&harness.org_id, inbound_event("T", "m1", "do X"))
        .await
        .unwrap();
    let promoted = harness.statemachine.promote_queued().await.unwrap();
    assert_eq!(promoted, 1);

    let job = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T").await.unwrap().unwrap();
    let message = harness.messages.oldest_queued_for_job(&job.id).await.unwrap();
    assert!(message.is_none(), "the only message should now be in_progress, not queued");

    let frame = recv_coordinator_frame(&mut agent1).await;
    let (message_id, prompt) = match frame {
        CoordinatorFrame::StartSession { job_id, message_id, prompt, .. } => {
            assert_eq!(job_id, job.id);
            (message_id, prompt)
        }
        other => panic!("expected start_session, got {other:?}"),
    };
    assert_eq!(prompt, "do X");

    harness
        .statemachine
        .handle(
            &harness.org_id,
            "agent-1",
            AgentFrame::Result {
                id: "r1".to_string(),
                job_id: job.id.clone(),
                message_id: message_id.clone(),
                text: "done".to_string(),
                session_id: Some("sess-1".to_string()),
                pr_url: Some("https://example.com/pr/42".to_string()),
                commit_hash: None,
                usage: Some(Usage { prompt_tokens: 10, completion_tokens: 20, cost_micros: 300 }),
            },
        )
        .await;

    let reloaded_message = harness.messages.get(&message_id).await.unwrap().unwrap();
    assert_eq!(reloaded_message.status, dispatchd::MessageStatus::Completed);
    let reloaded_job = harness.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(reloaded_job.status, dispatchd::JobStatus::Completed);

    let replies = harness.chat.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, "T");
    assert!(replies[0].1.contains("done"));
    assert!(replies[0].1.contains("https://example.com/pr/42"));
}

#[tokio::test]
async fn s2_second_message_queues_until_the_first_completes() {
    let harness = build_harness().await;
    let mut agent1 = connect_agent(&harness, "agent-1").await;

    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T", "m1", "do X")).await.unwrap();
    harness.statemachine.promote_queued().await.unwrap();
    let frame = recv_coordinator_frame(&mut agent1).await;
    let m1_id = match frame {
        CoordinatorFrame::StartSession { message_id, .. } => message_id,
        other => panic!("expected start_session, got {other:?}"),
    };

    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T", "m2", "more")).await.unwrap();
    let promoted = harness.statemachine.promote_queued().await.unwrap();
    assert_eq!(promoted, 0, "m2 must stay QUEUED while m1 is in_progress (P2)");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), agent1.recv()).await.is_err(),
        "no second frame should be sent to the agent while m1 is outstanding"
    );

    let job = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T").await.unwrap().unwrap();

    harness
        .statemachine
        .handle(
            &harness.org_id,
            "agent-1",
            AgentFrame::Result {
                id: "r1".to_string(),
                job_id: job.id.clone(),
                message_id: m1_id,
                text: "done with m1".to_string(),
                session_id: Some("sess-1".to_string()),
                pr_url: None,
                commit_hash: None,
                usage: None,
            },
        )
        .await;

    let promoted = harness.statemachine.promote_queued().await.unwrap();
    assert_eq!(promoted, 1, "m2 should advance once m1 has completed");

    let frame = recv_coordinator_frame(&mut agent1).await;
    match frame {
        CoordinatorFrame::ContinueSession { session_id, prompt, .. } => {
            assert_eq!(session_id, "sess-1");
            assert_eq!(prompt, "more");
        }
        other => panic!("expected continue_session reusing the prior session, got {other:?}"),
    }
}

#[tokio::test]
async fn s3_parallel_threads_each_get_their_own_agent() {
    let harness = build_harness().await;
    let mut agent1 = connect_agent(&harness, "agent-1").await;
    let mut agent2 = connect_agent(&harness, "agent-2").await;

    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T1", "m1", "task one")).await.unwrap();
    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T2", "m2", "task two")).await.unwrap();

    let promoted = harness.statemachine.promote_queued().await.unwrap();
    assert_eq!(promoted, 2, "both threads should be dispatched in the same pass");

    let frame1 = recv_coordinator_frame(&mut agent1).await;
    let frame2 = recv_coordinator_frame(&mut agent2).await;

    for frame in [&frame1, &frame2] {
        assert!(matches!(frame, CoordinatorFrame::StartSession { .. }));
    }

    let job1 = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T1").await.unwrap().unwrap();
    let job2 = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T2").await.unwrap().unwrap();
    assert_eq!(job1.status, dispatchd::JobStatus::InProgress);
    assert_eq!(job2.status, dispatchd::JobStatus::InProgress);
}

#[tokio::test]
async fn s4_agent_crash_redispatches_without_a_session_id() {
    let harness = build_harness().await;
    let mut agent1 = connect_agent(&harness, "agent-1").await;

    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T", "m1", "do X")).await.unwrap();
    harness.statemachine.promote_queued().await.unwrap();
    let _ = recv_coordinator_frame(&mut agent1).await;

    let job = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T").await.unwrap().unwrap();
    let in_progress = harness.messages.in_progress_for_job(&job.id).await.unwrap();
    assert!(in_progress.is_some(), "m1 should be in_progress before the crash");

    // Simulate the socket dropping: the registry releases the agent's
    // assignments and the handler demotes every affected job, exactly as
    // `MessageChannel::accept`'s disconnect path does.
    let released_job_ids = harness.registry.deregister(&harness.org_id, "agent-1").await.unwrap();
    assert_eq!(released_job_ids, vec![job.id.clone()]);
    harness.statemachine.on_disconnect(&harness.org_id, "agent-1", &released_job_ids).await;

    let message = harness.messages.in_progress_for_job(&job.id).await.unwrap();
    assert!(message.is_none(), "the in-flight message must be back in QUEUED after the crash (P7)");

    let mut agent2 = connect_agent(&harness, "agent-2").await;
    let promoted = harness.statemachine.promote_queued().await.unwrap();
    assert_eq!(promoted, 1);

    let frame = recv_coordinator_frame(&mut agent2).await;
    match frame {
        CoordinatorFrame::StartSession { job_id, .. } => assert_eq!(job_id, job.id),
        other => panic!("expected a fresh start_session (no prior session survives a crash), got {other:?}"),
    }
}

#[tokio::test]
async fn s6_idle_completed_jobs_are_cleaned_up() {
    let harness = build_harness().await;
    let mut agent1 = connect_agent(&harness, "agent-1").await;

    harness.statemachine.handle_inbound_event(&harness.org_id, inbound_event("T", "m1", "do X")).await.unwrap();
    harness.statemachine.promote_queued().await.unwrap();
    let frame = recv_coordinator_frame(&mut agent1).await;
    let message_id = match frame {
        CoordinatorFrame::StartSession { message_id, .. } => message_id,
        other => panic!("expected start_session, got {other:?}"),
    };
    let job = harness.jobs.find_by_thread(&harness.org_id, ChatPlatform::Slack, "T").await.unwrap().unwrap();

    harness
        .statemachine
        .handle(
            &harness.org_id,
            "agent-1",
            AgentFrame::Result {
                id: "r1".to_string(),
                job_id: job.id.clone(),
                message_id,
                text: "done".to_string(),
                session_id: None,
                pr_url: None,
                commit_hash: None,
                usage: None,
            },
        )
        .await;

    // Backdate the job past the idle threshold the way the real clock would
    // have, rather than sleeping in the test.
    sqlx::query("UPDATE jobs SET updated_at = datetime('now', '-35 minutes') WHERE id = ?")
        .bind(&job.id)
        .execute(&harness.pool)
        .await
        .unwrap();

    let idle_for = chrono::Duration::minutes(30);
    let idle_jobs = harness.jobs.list_idle_completed(idle_for).await.unwrap();
    assert_eq!(idle_jobs.len(), 1);
    assert_eq!(idle_jobs[0].id, job.id);

    harness.jobs.delete_with_messages(&job.id).await.unwrap();

    assert!(harness.jobs.get(&job.id).await.unwrap().is_none());
    let remaining_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages WHERE job_id = ?")
        .bind(&job.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(remaining_messages, 0);
    let remaining_assignments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agent_job_assignments WHERE job_id = ?")
        .bind(&job.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(remaining_assignments, 0);
}

#[tokio::test]
async fn s5_unacknowledged_frame_is_retransmitted_until_acked() {
    let harness = build_harness().await;
    harness.registry.upsert_active(&harness.org_id, "agent-1", 1).await.unwrap();
    let client_id = uuid::Uuid::new_v4().to_string();
    let (sender, mut receiver) = mpsc::channel(8);
    harness
        .channel
        .connections()
        .register(client_id.clone(), harness.org_id.clone(), "agent-1".to_string(), sender)
        .await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let _retry_sweep = harness.channel.spawn_retry_sweep(cancel.clone());

    let frame = CoordinatorFrame::StartSession {
        id: "frm-1".to_string(),
        job_id: "job-1".to_string(),
        message_id: "msg-1".to_string(),
        prompt: "do X".to_string(),
        repo_url: "https://example.com/repo.git".to_string(),
        options: None,
    };
    harness.channel.send_reliable(&client_id, &frame).await.unwrap();

    let first = recv_coordinator_frame(&mut receiver).await;
    assert_eq!(first.id(), "frm-1", "the initial send should carry the frame's own id");

    // ack_timeout is 50ms and the retry sweep scans every 20ms; withholding
    // the ack past that window must redeliver the identical frame.
    let redelivered = recv_coordinator_frame(&mut receiver).await;
    assert_eq!(redelivered.id(), "frm-1");
    match redelivered {
        CoordinatorFrame::StartSession { ref prompt, ref job_id, .. } => {
            assert_eq!(prompt, "do X");
            assert_eq!(job_id, "job-1");
        }
        other => panic!("expected the same start_session retransmitted, got {other:?}"),
    }

    assert!(harness.channel.acknowledge("frm-1").await, "ack should apply to a pending frame");

    // No further retransmission should follow once acked, even after
    // waiting out another retry-scan window.
    let after_ack = tokio::time::timeout(Duration::from_millis(150), receiver.recv()).await;
    assert!(after_ack.is_err(), "an acked frame must not be retransmitted again");

    cancel.cancel();
}
