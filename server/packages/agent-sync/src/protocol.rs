//! Wire messages exchanged with agent hosts.
//!
//! Every frame is one JSON object tagged by `type`. Hosts never compute
//! deltas: `response_chunk` always carries the full content of the message
//! being streamed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    HostReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_thread_id: Option<String>,
    },
    ThreadCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ResponseChunk {
        thread_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    ResponseComplete {
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    UserInitiatedThread {
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ThreadRenamed {
        thread_id: String,
        title: String,
    },
    ThreadLoadFailed {
        thread_id: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HostReady { .. } => "host_ready",
            Self::ThreadCreated { .. } => "thread_created",
            Self::ResponseChunk { .. } => "response_chunk",
            Self::ResponseComplete { .. } => "response_complete",
            Self::UserInitiatedThread { .. } => "user_initiated_thread",
            Self::ThreadRenamed { .. } => "thread_renamed",
            Self::ThreadLoadFailed { .. } => "thread_load_failed",
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::HostReady {
                resumed_thread_id, ..
            } => resumed_thread_id.as_deref(),
            Self::ThreadCreated { thread_id, .. }
            | Self::ResponseChunk { thread_id, .. }
            | Self::ResponseComplete { thread_id, .. }
            | Self::UserInitiatedThread { thread_id, .. }
            | Self::ThreadRenamed { thread_id, .. }
            | Self::ThreadLoadFailed { thread_id, .. } => Some(thread_id),
        }
    }

    /// Rejects events whose required identifiers are present but empty.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(thread_id) = self.thread_id() {
            if thread_id.trim().is_empty() {
                return Err(ProtocolError::MissingField {
                    kind: self.kind(),
                    field: "thread_id",
                });
            }
        }
        Ok(())
    }
}

/// Server to host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SubmitPrompt {
        /// None asks the host to open a new thread.
        thread_id: Option<String>,
        content: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resume: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },
    OpenThread {
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },
    QueryState,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubmitPrompt { .. } => "submit_prompt",
            Self::OpenThread { .. } => "open_thread",
            Self::QueryState => "query_state",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SubmitPrompt { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} is missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

pub fn decode_event(text: &str) -> Result<SyncEvent, ProtocolError> {
    let event: SyncEvent = serde_json::from_str(text)?;
    event.validate()?;
    Ok(event)
}

pub fn encode_command(command: &Command) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(command)?)
}
