// ABOUTME: Wire types for session stream connections
// ABOUTME: Outbound events carry a per-session sequence number and a timestamp

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code sent to a connection that fell behind the channel
pub const LAGGED_ERROR_CODE: &str = "lagged";

/// Final outcome of an execution as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub success: bool,
    pub response: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted {
        execution_id: String,
        prompt: String,
    },
    Progress {
        execution_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn: Option<u32>,
    },
    ExecutionCompleted {
        execution_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_detail: Option<String>,
        summary: CompletionSummary,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    Heartbeat,
    Pong,
}

impl EventPayload {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        EventPayload::Error {
            code: code.into(),
            message: message.into(),
            execution_id: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ExecutionStarted { .. } => "execution_started",
            EventPayload::Progress { .. } => "progress",
            EventPayload::ExecutionCompleted { .. } => "execution_completed",
            EventPayload::Error { .. } => "error",
            EventPayload::Heartbeat => "heartbeat",
            EventPayload::Pong => "pong",
        }
    }
}

/// One outbound message
///
/// Broadcast events carry a `sequence` that is strictly increasing per
/// session. Replies addressed to a single connection (pong, submission
/// errors, lag notices) have none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// A reply for one connection, outside the session sequence
    pub fn direct(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            sequence: None,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Messages a client may send over its connection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Execute {
        prompt: String,
        #[serde(default)]
        max_turns: Option<u32>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        allowed_tools: Vec<String>,
        #[serde(default)]
        disallowed_tools: Vec<String>,
    },
    Ping,
}
