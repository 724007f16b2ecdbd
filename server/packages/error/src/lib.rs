use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Conflict,
    SessionNotFound,
    InteractionNotFound,
    HostNotConnected,
    QueueFull,
    StoreError,
    LifecycleError,
    ProtocolError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-sync:error:invalid_request",
            Self::Conflict => "urn:agent-sync:error:conflict",
            Self::SessionNotFound => "urn:agent-sync:error:session_not_found",
            Self::InteractionNotFound => "urn:agent-sync:error:interaction_not_found",
            Self::HostNotConnected => "urn:agent-sync:error:host_not_connected",
            Self::QueueFull => "urn:agent-sync:error:queue_full",
            Self::StoreError => "urn:agent-sync:error:store_error",
            Self::LifecycleError => "urn:agent-sync:error:lifecycle_error",
            Self::ProtocolError => "urn:agent-sync:error:protocol_error",
            Self::Timeout => "urn:agent-sync:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Conflict => "Conflict",
            Self::SessionNotFound => "Session Not Found",
            Self::InteractionNotFound => "Interaction Not Found",
            Self::HostNotConnected => "Host Not Connected",
            Self::QueueFull => "Queue Full",
            Self::StoreError => "Store Error",
            Self::LifecycleError => "Lifecycle Error",
            Self::ProtocolError => "Protocol Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Conflict => 409,
            Self::SessionNotFound => 404,
            Self::InteractionNotFound => 404,
            Self::HostNotConnected => 409,
            Self::QueueFull => 503,
            Self::StoreError => 500,
            Self::LifecycleError => 502,
            Self::ProtocolError => 400,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Errors shared by every component of the sync engine.
///
/// Components that swallow errors (streaming writes, lifecycle restarts) log
/// these instead of returning them; everything reachable from the HTTP API
/// renders through [`SyncError::to_problem_details`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("interaction not found: {interaction_id}")]
    InteractionNotFound { interaction_id: String },
    #[error("host not connected: {host_id}")]
    HostNotConnected { host_id: String },
    #[error("outbound queue full: {host_id}")]
    QueueFull { host_id: String },
    #[error("store error: {message}")]
    Store { message: String },
    #[error("lifecycle error: {message}")]
    Lifecycle {
        session_id: Option<String>,
        message: String,
    },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl SyncError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::InteractionNotFound { .. } => ErrorType::InteractionNotFound,
            Self::HostNotConnected { .. } => ErrorType::HostNotConnected,
            Self::QueueFull { .. } => ErrorType::QueueFull,
            Self::Store { .. } => ErrorType::StoreError,
            Self::Lifecycle { .. } => ErrorType::LifecycleError,
            Self::Protocol { .. } => ErrorType::ProtocolError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::InteractionNotFound { interaction_id } => {
                extensions.insert(
                    "interactionId".to_string(),
                    Value::String(interaction_id.clone()),
                );
            }
            Self::HostNotConnected { host_id } | Self::QueueFull { host_id } => {
                extensions.insert("hostId".to_string(), Value::String(host_id.clone()));
            }
            Self::Lifecycle {
                session_id: Some(session_id),
                ..
            } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::Timeout {
                message: Some(message),
            } => {
                let mut details = Map::new();
                details.insert("message".to_string(), Value::String(message.clone()));
                extensions.insert("details".to_string(), Value::Object(details));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<SyncError> for ProblemDetails {
    fn from(value: SyncError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SyncError> for ProblemDetails {
    fn from(value: &SyncError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_renders_problem_with_extension() {
        let err = SyncError::SessionNotFound {
            session_id: "ses_1".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:agent-sync:error:session_not_found");
        assert_eq!(
            problem.extensions.get("sessionId"),
            Some(&Value::String("ses_1".to_string()))
        );

        let json = serde_json::to_value(&problem).expect("serialize problem");
        assert_eq!(json["title"], "Session Not Found");
        assert_eq!(json["sessionId"], "ses_1");
    }

    #[test]
    fn queue_full_is_a_soft_service_error() {
        let err = SyncError::QueueFull {
            host_id: "host-a".to_string(),
        };
        assert_eq!(err.error_type(), ErrorType::QueueFull);
        assert_eq!(err.error_type().status_code(), 503);
        assert_eq!(err.to_string(), "outbound queue full: host-a");
    }
}
