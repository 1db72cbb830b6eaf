//! Top-level error types for dispatchd.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable store connection and migration errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction already active on this context")]
    NestedTransactionConflict,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Message Channel (transport) errors. §7 "transient transport" — handled
/// locally with backoff, never surfaced to the user directly.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("agent {ccagent_id} is not connected")]
    NotConnected { ccagent_id: String },

    #[error("send to client {client_id} failed: {reason}")]
    SendFailed { client_id: String, reason: String },

    #[error("ack timeout exhausted for message {message_id} after {attempts} attempts")]
    RetriesExhausted { message_id: String, attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent wire protocol violations. §7 "protocol violation" — fatal for the
/// connection; the agent may reconnect.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame exceeds maximum size of {max_bytes} bytes")]
    FrameTooLarge { max_bytes: usize },

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("first frame must be `hello`")]
    MissingHello,

    #[error("organization secret mismatch for ccagent_id {ccagent_id}")]
    AuthMismatch { ccagent_id: String },

    #[error("tenant mismatch: frame claims org {claimed} but connection is bound to {actual}")]
    TenantMismatch { claimed: String, actual: String },
}

/// Job & Message state machine / Dispatcher invariant violations. §7
/// "invariant violation" — refuses the transaction and logs; retried next tick.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("processed message {message_id} not found")]
    MessageNotFound { message_id: String },

    #[error("cannot advance message {message_id} from {from} to {to}")]
    InvalidStatusTransition {
        message_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("job {job_id} already has an active assignment to agent {agent_id}")]
    AlreadyAssigned { job_id: String, agent_id: String },

    #[error("no assignment exists for job {job_id}")]
    NoAssignment { job_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Chat Adapter (Slack/Discord) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("failed to post reply to thread {thread_key}: {reason}")]
    PostFailed { thread_key: String, reason: String },

    #[error("failed to edit message {posted_id}: {reason}")]
    EditFailed { posted_id: String, reason: String },

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("adapter not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
