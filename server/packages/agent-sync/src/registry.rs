//! Live duplex connections to agent hosts.
//!
//! The registry map lock only covers lookups, inserts and removals. Commands
//! are handed to a bounded channel with `try_send`, so nothing here waits on
//! a host.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use agent_sync_error::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Connecting,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed to the socket writer.
    Sent,
    /// Held until the host reports ready.
    Queued,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full for host {host_id}")]
    QueueFull { host_id: String },
    #[error("host {host_id} is not connected")]
    NotFound { host_id: String },
}

impl From<EnqueueError> for SyncError {
    fn from(value: EnqueueError) -> Self {
        match value {
            EnqueueError::QueueFull { host_id } => SyncError::QueueFull { host_id },
            EnqueueError::NotFound { host_id } => SyncError::HostNotConnected { host_id },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadyError {
    #[error("host {host_id} is not connected")]
    NotFound { host_id: String },
    #[error("host {host_id} is already ready")]
    AlreadyReady { host_id: String },
}

#[derive(Debug)]
struct ConnectionState {
    readiness: Readiness,
    pending: VecDeque<Command>,
}

#[derive(Debug)]
pub struct AgentConnection {
    host_id: String,
    connection_id: String,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    outbound: mpsc::Sender<Command>,
    state: Mutex<ConnectionState>,
    closed: watch::Sender<bool>,
}

impl AgentConnection {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn readiness(&self) -> Readiness {
        self.state
            .lock()
            .map(|state| state.readiness)
            .unwrap_or(Readiness::Connecting)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the registry has dropped this connection.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut state) = self.state.lock() {
            state.pending.clear();
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host_id: self.host_id.clone(),
            connection_id: self.connection_id.clone(),
            readiness: self.readiness(),
            pending_commands: self.pending_len(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub host_id: String,
    pub connection_id: String,
    pub readiness: Readiness,
    pub pending_commands: usize,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// What a socket task needs to drive one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub connection: Arc<AgentConnection>,
    pub outbound: mpsc::Receiver<Command>,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<AgentConnection>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a fresh connection, replacing (and closing) any previous one
    /// for the same host.
    pub fn register(&self, host_id: &str) -> ConnectionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.capacity);
        let (closed, _) = watch::channel(false);
        let now = Utc::now();
        let connection = Arc::new(AgentConnection {
            host_id: host_id.to_string(),
            connection_id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            outbound: outbound_tx,
            state: Mutex::new(ConnectionState {
                readiness: Readiness::Connecting,
                pending: VecDeque::new(),
            }),
            closed,
        });

        let previous = match self.connections.write() {
            Ok(mut connections) => connections.insert(host_id.to_string(), connection.clone()),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            tracing::info!(
                host_id = %host_id,
                previous_connection = %previous.connection_id,
                "replacing existing host connection"
            );
            previous.close();
        }

        ConnectionHandle {
            connection,
            outbound: outbound_rx,
        }
    }

    pub fn deregister(&self, host_id: &str) -> Option<Arc<AgentConnection>> {
        let removed = self
            .connections
            .write()
            .ok()
            .and_then(|mut connections| connections.remove(host_id));
        if let Some(connection) = &removed {
            connection.close();
        }
        removed
    }

    /// Deregisters only if `connection` is still the registered one.
    pub fn release(&self, connection: &AgentConnection) -> bool {
        let removed = match self.connections.write() {
            Ok(mut connections) => {
                let current = connections
                    .get(&connection.host_id)
                    .map(|current| current.connection_id == connection.connection_id)
                    .unwrap_or(false);
                if current {
                    connections.remove(&connection.host_id)
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        connection.close();
        removed.is_some()
    }

    pub fn get(&self, host_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .ok()
            .and_then(|connections| connections.get(host_id).cloned())
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.get(host_id).is_some()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let connections: Vec<Arc<AgentConnection>> = self
            .connections
            .read()
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default();
        let mut infos: Vec<ConnectionInfo> = connections.iter().map(|conn| conn.info()).collect();
        infos.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        infos
    }

    pub fn enqueue(&self, host_id: &str, command: Command) -> Result<EnqueueOutcome, EnqueueError> {
        let connection = self.get(host_id).ok_or_else(|| EnqueueError::NotFound {
            host_id: host_id.to_string(),
        })?;

        let mut state = connection
            .state
            .lock()
            .map_err(|_| EnqueueError::NotFound {
                host_id: host_id.to_string(),
            })?;
        match state.readiness {
            Readiness::Connecting => {
                if state.pending.len() >= self.capacity {
                    return Err(EnqueueError::QueueFull {
                        host_id: host_id.to_string(),
                    });
                }
                state.pending.push_back(command);
                Ok(EnqueueOutcome::Queued)
            }
            Readiness::Ready => match connection.outbound.try_send(command) {
                Ok(()) => Ok(EnqueueOutcome::Sent),
                Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::QueueFull {
                    host_id: host_id.to_string(),
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::NotFound {
                    host_id: host_id.to_string(),
                }),
            },
        }
    }

    /// Marks the host ready and flushes held commands in arrival order.
    /// Returns the commands that reached the socket writer.
    pub fn mark_ready(&self, host_id: &str) -> Result<Vec<Command>, ReadyError> {
        let connection = self.get(host_id).ok_or_else(|| ReadyError::NotFound {
            host_id: host_id.to_string(),
        })?;
        let mut state = connection
            .state
            .lock()
            .map_err(|_| ReadyError::NotFound {
                host_id: host_id.to_string(),
            })?;
        if state.readiness == Readiness::Ready {
            return Err(ReadyError::AlreadyReady {
                host_id: host_id.to_string(),
            });
        }
        state.readiness = Readiness::Ready;

        let mut flushed = Vec::with_capacity(state.pending.len());
        while let Some(command) = state.pending.pop_front() {
            match connection.outbound.try_send(command.clone()) {
                Ok(()) => flushed.push(command),
                Err(err) => {
                    tracing::warn!(
                        host_id = %host_id,
                        command = command.kind(),
                        error = %err,
                        "dropping held command during ready flush"
                    );
                }
            }
        }
        tracing::info!(
            host_id = %host_id,
            flushed = flushed.len(),
            "host ready"
        );
        Ok(flushed)
    }

    /// Drops a connection that is still `connecting`. Returns whether it did.
    pub fn expire_if_not_ready(&self, connection: &AgentConnection) -> bool {
        if connection.readiness() == Readiness::Ready || connection.is_closed() {
            return false;
        }
        let discarded = connection.pending_len();
        let released = self.release(connection);
        if released {
            tracing::warn!(
                host_id = %connection.host_id,
                discarded,
                "host never became ready; connection dropped"
            );
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(request_id: &str) -> Command {
        Command::SubmitPrompt {
            thread_id: None,
            content: format!("prompt {request_id}"),
            request_id: request_id.to_string(),
            resume: false,
            agent_name: None,
        }
    }

    #[tokio::test]
    async fn commands_before_ready_flush_in_order() {
        let registry = ConnectionRegistry::new(100);
        let mut handle = registry.register("host-a");

        assert_eq!(
            registry.enqueue("host-a", prompt("req_1")),
            Ok(EnqueueOutcome::Queued)
        );
        assert_eq!(
            registry.enqueue("host-a", prompt("req_2")),
            Ok(EnqueueOutcome::Queued)
        );
        assert!(handle.outbound.try_recv().is_err());

        let flushed = registry.mark_ready("host-a").expect("ready");
        assert_eq!(flushed.len(), 2);
        assert_eq!(handle.outbound.recv().await, Some(prompt("req_1")));
        assert_eq!(handle.outbound.recv().await, Some(prompt("req_2")));

        assert_eq!(
            registry.enqueue("host-a", Command::QueryState),
            Ok(EnqueueOutcome::Sent)
        );
        assert_eq!(handle.outbound.recv().await, Some(Command::QueryState));
    }

    #[test]
    fn full_pre_ready_queue_is_a_soft_failure() {
        let registry = ConnectionRegistry::new(2);
        let _handle = registry.register("host-a");
        registry.enqueue("host-a", prompt("req_1")).expect("first");
        registry.enqueue("host-a", prompt("req_2")).expect("second");
        assert_eq!(
            registry.enqueue("host-a", prompt("req_3")),
            Err(EnqueueError::QueueFull {
                host_id: "host-a".to_string()
            })
        );
    }

    #[test]
    fn unknown_host_is_not_found() {
        let registry = ConnectionRegistry::new(4);
        assert_eq!(
            registry.enqueue("missing", Command::QueryState),
            Err(EnqueueError::NotFound {
                host_id: "missing".to_string()
            })
        );
    }

    #[test]
    fn second_ready_is_rejected() {
        let registry = ConnectionRegistry::new(4);
        let _handle = registry.register("host-a");
        registry.mark_ready("host-a").expect("ready");
        assert_eq!(
            registry.mark_ready("host-a"),
            Err(ReadyError::AlreadyReady {
                host_id: "host-a".to_string()
            })
        );
    }

    #[test]
    fn stale_connection_cannot_release_its_replacement() {
        let registry = ConnectionRegistry::new(4);
        let first = registry.register("host-a");
        let second = registry.register("host-a");
        assert!(first.connection.is_closed());

        assert!(!registry.release(&first.connection));
        let current = registry.get("host-a").expect("still registered");
        assert_eq!(current.connection_id(), second.connection.connection_id());
    }

    #[test]
    fn expiring_unready_connection_discards_queue() {
        let registry = ConnectionRegistry::new(4);
        let handle = registry.register("host-a");
        registry.enqueue("host-a", prompt("req_1")).expect("queued");

        assert!(registry.expire_if_not_ready(&handle.connection));
        assert!(!registry.is_connected("host-a"));
        assert_eq!(handle.connection.pending_len(), 0);
        assert!(handle.connection.is_closed());
    }

    #[test]
    fn ready_connection_is_not_expired() {
        let registry = ConnectionRegistry::new(4);
        let handle = registry.register("host-a");
        registry.mark_ready("host-a").expect("ready");
        assert!(!registry.expire_if_not_ready(&handle.connection));
        assert!(registry.is_connected("host-a"));
    }
}
