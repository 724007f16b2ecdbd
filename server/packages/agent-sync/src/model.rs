//! Durable records shared by the store, the engine, and subscribers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_THREAD_TITLE: &str = "New Conversation";
pub const DEFAULT_USER_THREAD_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Idle,
    Working,
    Done,
}

impl WorkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "working" => Some(Self::Working),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    /// Host currently serving this session.
    pub host_id: Option<String>,
    pub group_id: Option<String>,
    pub agent_thread_id: Option<String>,
    pub desired_state: DesiredState,
    pub work_state: WorkState,
    /// The single interaction that may still be streaming.
    pub current_interaction_id: Option<String>,
    /// Correlation ID of the last dispatched prompt, cleared on completion.
    pub active_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            host_id,
            group_id: None,
            agent_thread_id: None,
            desired_state: DesiredState::Running,
            work_state: WorkState::Idle,
            current_interaction_id: None,
            active_request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub session_id: String,
    pub request_id: Option<String>,
    pub prompt: String,
    pub response: String,
    /// Key of the agent message currently being streamed into `response`.
    pub segment_key: Option<String>,
    /// Byte offset in `response` where the current segment starts.
    pub segment_offset: usize,
    pub completed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Interaction {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            request_id,
            prompt: prompt.into(),
            response: String::new(),
            segment_key: None,
            segment_offset: 0,
            completed: false,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Folds a full-content update for one agent message into the response.
    ///
    /// The same segment key replaces the current segment; a new key starts a
    /// new segment after a blank line. Returns whether the response changed.
    pub fn apply_content(&mut self, segment_key: Option<&str>, content: &str) -> bool {
        let same_segment = match (self.segment_key.as_deref(), segment_key) {
            (_, None) | (None, _) => true,
            (Some(current), Some(next)) => current == next,
        };

        if !same_segment {
            if !self.response.is_empty() {
                self.response.push_str("\n\n");
            }
            self.segment_offset = self.response.len();
        }
        if segment_key.is_some() {
            self.segment_key = segment_key.map(str::to_string);
        }

        let base = self.segment_offset.min(self.response.len());
        if self.response[base..] == *content {
            return !same_segment;
        }
        self.response.truncate(base);
        self.response.push_str(content);
        self.updated_at = Utc::now();
        true
    }

    pub fn complete(&mut self, error: Option<String>) {
        let now = Utc::now();
        self.completed = true;
        self.error = error;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

pub fn new_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_interaction_id() -> String {
    format!("int_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}
