#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tower::util::ServiceExt;

use agent_sync::config::SyncConfig;
use agent_sync::model::Session;
use agent_sync::protocol::{Command, SyncEvent};
use agent_sync::router::build_router;
use agent_sync::store::MemorySessionStore;
use agent_sync::{HostSession, NewSession, SyncEngine};

pub const HOST: &str = "host-a";

pub struct TestApp {
    pub store: Arc<MemorySessionStore>,
    pub engine: Arc<SyncEngine>,
    pub app: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemorySessionStore::new()))
    }

    pub fn with_store(store: Arc<MemorySessionStore>) -> Self {
        let engine = SyncEngine::new(SyncConfig::default(), store.clone(), None);
        let app = build_router(engine.clone());
        Self { store, engine, app }
    }

    pub fn connect(&self, host_id: &str) -> FakeHost {
        FakeHost {
            host_id: host_id.to_string(),
            engine: self.engine.clone(),
            session: self.engine.connect_host(host_id),
        }
    }

    pub async fn create_session(&self, host_id: &str, name: &str) -> Session {
        self.engine
            .create_session(NewSession {
                host_id: host_id.to_string(),
                name: Some(name.to_string()),
                ..NewSession::default()
            })
            .await
            .expect("create session")
    }
}

/// Drives the engine the way a host socket would, but synchronously: each
/// event is fully handled before `send` returns.
pub struct FakeHost {
    pub host_id: String,
    pub engine: Arc<SyncEngine>,
    pub session: HostSession,
}

impl FakeHost {
    pub async fn send(&self, event: SyncEvent) {
        self.engine
            .handle_event(&self.host_id, event)
            .await
            .expect("handle event");
    }

    pub async fn ready(&self) {
        self.send(SyncEvent::HostReady {
            host_id: Some(self.host_id.clone()),
            resumed_thread_id: None,
        })
        .await;
    }

    pub async fn thread_created(&self, request_id: &str, thread_id: &str) {
        self.send(SyncEvent::ThreadCreated {
            request_id: Some(request_id.to_string()),
            thread_id: thread_id.to_string(),
            group_id: None,
            title: None,
        })
        .await;
    }

    pub async fn chunk(&self, thread_id: &str, request_id: &str, content: &str) {
        self.send(SyncEvent::ResponseChunk {
            thread_id: thread_id.to_string(),
            content: content.to_string(),
            request_id: Some(request_id.to_string()),
            message_id: None,
        })
        .await;
    }

    pub async fn complete(&self, thread_id: &str, request_id: &str) {
        self.send(SyncEvent::ResponseComplete {
            thread_id: thread_id.to_string(),
            request_id: Some(request_id.to_string()),
        })
        .await;
    }

    pub fn next_command(&mut self) -> Option<Command> {
        match self.session.outbound.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Takes the next command and returns its `submit_prompt` fields.
    pub fn expect_prompt(&mut self) -> SubmittedPrompt {
        match self.next_command() {
            Some(Command::SubmitPrompt {
                thread_id,
                content,
                request_id,
                resume,
                ..
            }) => SubmittedPrompt {
                thread_id,
                content,
                request_id,
                resume,
            },
            other => panic!("expected submit_prompt, got {other:?}"),
        }
    }

    pub async fn disconnect(self) {
        self.engine.disconnect_host(&self.session.connection).await;
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedPrompt {
    pub thread_id: Option<String>,
    pub content: String,
    pub request_id: String,
    pub resume: bool,
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}
