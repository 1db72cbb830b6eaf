//! dispatchd: routes chat messages from Slack/Discord to remote coding-agent
//! worker processes, tracking job and message state through a durable store.

pub mod api;
pub mod chat;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod registry;
pub mod statemachine;

#[cfg(feature = "metrics")]
pub mod telemetry;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// A tenant. Every Job, User, Connected Channel, and Active Agent is scoped
/// to exactly one Organization; no query crosses this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// Shared secret agents present in their `hello` frame. Stored encrypted
    /// at rest (AES-GCM, keyed from the process-level master key).
    pub agent_secret_ciphertext: Vec<u8>,
    pub agent_secret_nonce: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A person on a chat platform, identified by an (org, auth_provider,
/// auth_provider_id) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub org_id: String,
    pub auth_provider: ChatPlatform,
    pub auth_provider_id: String,
    pub display_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The chat platform a Connected Channel, User, or Job is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPlatform {
    Slack,
    Discord,
}

impl ChatPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPlatform::Slack => "slack",
            ChatPlatform::Discord => "discord",
        }
    }
}

impl std::str::FromStr for ChatPlatform {
    type Err = crate::error::ChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "slack" => Ok(ChatPlatform::Slack),
            "discord" => Ok(ChatPlatform::Discord),
            other => Err(crate::error::ChatError::NotConfigured(other.to_string())),
        }
    }
}

/// A chat surface (Slack channel, Discord channel/thread) the coordinator
/// posts into and reads events from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedChannel {
    pub id: String,
    pub org_id: String,
    pub platform: ChatPlatform,
    pub platform_channel_id: String,
    /// Repository an agent clones when a Job on this channel is dispatched
    /// and no session-specific override applies (spec.md §3 "may carry a
    /// default repository URL").
    pub default_repository_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Lifecycle state of a Job, derived from the status of its messages:
/// `Queued` while a message awaits dispatch, `InProgress` while one is being
/// worked, `Completed` once every message has completed. Monotonic except
/// for the Dispatcher's idle-timeout demotion from `InProgress` back to
/// `Queued`. spec.md names no Job-level error state — an agent error still
/// completes the message (see `ProcessedMessage::error_text`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            other => Err(crate::error::DispatchError::Other(anyhow::anyhow!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// A unit of ongoing conversational work bound to one thread on one
/// platform. Uniqueness: `(org_id, platform, thread_key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub org_id: String,
    pub channel_id: String,
    pub platform: ChatPlatform,
    pub thread_key: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Lifecycle state of a Processed Message (spec.md §3: `status ∈ {QUEUED,
/// IN_PROGRESS, COMPLETED}`, terminal state COMPLETED). An agent-reported
/// error is not a fourth status — per spec.md §7 it "is recorded as a
/// COMPLETED processed message carrying the agent's error text"; see
/// `ProcessedMessage::error_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    InProgress,
    Completed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::InProgress => "in_progress",
            MessageStatus::Completed => "completed",
        }
    }

    /// Status transition table backing P1 (the observed sequence is a prefix
    /// of `Queued, InProgress, Completed`) and P3 (terminal once Completed).
    /// `(InProgress, Queued)` is the Dispatcher's disconnect/inactivity
    /// demotion, not a step in the happy-path sequence.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress) | (InProgress, Completed) | (InProgress, Queued)
        )
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MessageStatus::Queued),
            "in_progress" => Ok(MessageStatus::InProgress),
            "completed" => Ok(MessageStatus::Completed),
            other => Err(crate::error::DispatchError::Other(anyhow::anyhow!(
                "unknown message status: {other}"
            ))),
        }
    }
}

/// An inbound chat message once it has entered the dispatch pipeline.
/// Uniqueness: `(job_id, platform_message_id)` — duplicate platform deliveries
/// of the same message are idempotent no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub id: String,
    pub org_id: String,
    pub job_id: String,
    pub user_id: String,
    pub platform_message_id: String,
    pub body: String,
    pub status: MessageStatus,
    /// Set when the agent's terminal frame was `error` rather than `result`
    /// (spec.md §7). The message still reaches COMPLETED either way; this
    /// is the only trace of which path it took.
    pub error_text: Option<String>,
    pub posted_reply_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A live, `hello`-authenticated remote coding-agent process. Uniqueness:
/// `(org_id, ccagent_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub id: String,
    pub org_id: String,
    pub ccagent_id: String,
    pub capacity: u32,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Lifecycle state of an Agent-Job Assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Released,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Released => "released",
        }
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "released" => Ok(AssignmentStatus::Released),
            other => Err(crate::error::DispatchError::Other(anyhow::anyhow!(
                "unknown assignment status: {other}"
            ))),
        }
    }
}

/// Binds one Job to one Active Agent. Uniqueness: `(agent_id, job_id)` while
/// `status = active` — a released assignment may be re-created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJobAssignment {
    pub id: String,
    pub org_id: String,
    pub job_id: String,
    pub agent_id: String,
    pub status: AssignmentStatus,
    /// The agent's session identity for this job, once one exists (set from
    /// a `result` frame's optional `session_id`). `None` until the agent's
    /// first successful turn, and lost whenever the assignment is recreated
    /// — spec.md §8 S4: a reconnect re-dispatches as `start_session`, "no
    /// session_id since prior session is lost".
    pub session_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub released_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Running token/cost counters for a Job (SUPPLEMENT, spec.md §3 "optional
/// companion"). Updated additively from `result`/`error` frame `usage` data.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationCost {
    pub job_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_micros: i64,
}
