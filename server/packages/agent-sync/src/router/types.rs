use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostListResponse {
    pub hosts: Vec<HostInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub host_id: String,
    pub connection_id: String,
    pub readiness: String,
    pub pending_commands: usize,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<ConnectionInfo> for HostInfo {
    fn from(info: ConnectionInfo) -> Self {
        Self {
            host_id: info.host_id,
            connection_id: info.connection_id,
            readiness: match info.readiness {
                Readiness::Connecting => "connecting".to_string(),
                Readiness::Ready => "ready".to_string(),
            },
            pending_commands: info.pending_commands,
            connected_at: info.connected_at,
            last_activity: info.last_activity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// `sent` or `queued` (held until the host is ready).
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPromptsResponse {
    pub retried: usize,
    pub queue: HostQueueSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_thread_id: Option<String>,
}

impl From<CreateSessionRequest> for NewSession {
    fn from(request: CreateSessionRequest) -> Self {
        Self {
            host_id: request.host_id,
            name: request.name,
            group_id: request.group_id,
            agent_thread_id: request.agent_thread_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionListQuery {
    #[serde(default)]
    pub desired_state: Option<DesiredState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PromptDisposition {
    Dispatched,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub status: PromptDisposition,
    pub prompt_id: String,
    /// 1-based position behind the in-flight prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl From<SubmitOutcome> for PromptResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Dispatched(prompt) => Self {
                status: PromptDisposition::Dispatched,
                prompt_id: prompt.id,
                position: None,
            },
            SubmitOutcome::Queued { prompt, position } => Self {
                status: PromptDisposition::Queued,
                prompt_id: prompt.id,
                position: Some(position),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateRequest {
    pub desired_state: DesiredState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}
