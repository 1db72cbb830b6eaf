//! Agent wire protocol: serde-tagged frames exchanged over the persistent
//! agent socket. Every frame is a JSON object with a `type` tag and (except
//! `hello`) an `id`; frames larger than `max_frame_bytes` are rejected before
//! decoding.

use serde::{Deserialize, Serialize};

/// Frames the coordinator sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    StartSession {
        id: String,
        job_id: String,
        message_id: String,
        prompt: String,
        repo_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<serde_json::Value>,
    },
    ContinueSession {
        id: String,
        job_id: String,
        message_id: String,
        session_id: String,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<serde_json::Value>,
    },
    Cancel {
        id: String,
        job_id: String,
    },
    Ping {
        id: String,
    },
}

impl CoordinatorFrame {
    /// The frame's own id, used as the reliable-delivery `message_id`.
    pub fn id(&self) -> &str {
        match self {
            CoordinatorFrame::StartSession { id, .. }
            | CoordinatorFrame::ContinueSession { id, .. }
            | CoordinatorFrame::Cancel { id, .. }
            | CoordinatorFrame::Ping { id } => id,
        }
    }
}

/// Optional token/cost usage carried on `result`/`error` frames, accumulated
/// into the job's Conversation Cost counters (SUPPLEMENT).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub cost_micros: i64,
}

/// Frames an agent sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Hello {
        id: String,
        ccagent_id: String,
        org_secret: String,
        #[serde(default = "default_capacity")]
        capacity: u32,
    },
    Ack {
        id: String,
    },
    Progress {
        id: String,
        job_id: String,
        message_id: String,
        text: String,
    },
    Result {
        id: String,
        job_id: String,
        message_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        id: String,
        job_id: String,
        message_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Pong {
        id: String,
    },
}

fn default_capacity() -> u32 {
    1
}

impl AgentFrame {
    pub fn id(&self) -> &str {
        match self {
            AgentFrame::Hello { id, .. }
            | AgentFrame::Ack { id }
            | AgentFrame::Progress { id, .. }
            | AgentFrame::Result { id, .. }
            | AgentFrame::Error { id, .. }
            | AgentFrame::Pong { id } => id,
        }
    }
}

/// Decode a raw text frame, enforcing the size guard before touching serde.
pub fn decode_agent_frame(
    raw: &str,
    max_frame_bytes: usize,
) -> Result<AgentFrame, crate::error::ProtocolError> {
    if raw.len() > max_frame_bytes {
        return Err(crate::error::ProtocolError::FrameTooLarge {
            max_bytes: max_frame_bytes,
        });
    }

    serde_json::from_str(raw).map_err(|e| crate::error::ProtocolError::Malformed(e.to_string()))
}

pub fn encode_coordinator_frame(frame: &CoordinatorFrame) -> String {
    serde_json::to_string(frame).expect("coordinator frames are always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_defaults_capacity_to_one_when_absent() {
        let raw = r#"{"type":"hello","id":"f1","ccagent_id":"agt-1","org_secret":"s3cr3t"}"#;
        let frame = decode_agent_frame(raw, 1024).expect("should decode");
        match frame {
            AgentFrame::Hello { capacity, .. } => assert_eq!(capacity, 1),
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let raw = "x".repeat(100);
        let error = decode_agent_frame(&raw, 10).expect_err("should reject");
        assert!(matches!(error, crate::error::ProtocolError::FrameTooLarge { max_bytes: 10 }));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let error = decode_agent_frame("not json", 1024).expect_err("should reject");
        assert!(matches!(error, crate::error::ProtocolError::Malformed(_)));
    }

    #[test]
    fn start_session_round_trips_through_json() {
        let frame = CoordinatorFrame::StartSession {
            id: "f1".to_string(),
            job_id: "job_1".to_string(),
            message_id: "msg_1".to_string(),
            prompt: "do X".to_string(),
            repo_url: "https://example.com/repo.git".to_string(),
            options: None,
        };
        let encoded = encode_coordinator_frame(&frame);
        assert!(encoded.contains("\"type\":\"start_session\""));
    }
}
