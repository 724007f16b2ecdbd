//! Backing-compute lifecycle seam and a local process implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use agent_sync_error::SyncError;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub type LifecycleFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Starts and probes the compute that hosts a session's agent.
pub trait LifecycleManager: Send + Sync + 'static {
    fn has_running_backend<'a>(&'a self, session_id: &'a str) -> LifecycleFuture<'a, bool>;

    fn start_backend<'a>(&'a self, session_id: &'a str) -> LifecycleFuture<'a, ()>;
}

#[derive(Debug, Clone)]
pub struct BackendLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl BackendLaunch {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Runs one local child process per session.
///
/// The child gets `AGENT_SYNC_SESSION_ID` in its environment and is expected
/// to connect back to the host endpoint on its own.
#[derive(Debug)]
pub struct ProcessLifecycleManager {
    launch: BackendLaunch,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessLifecycleManager {
    pub fn new(launch: BackendLaunch) -> Self {
        Self {
            launch,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running_count(&self) -> usize {
        let mut children = self.children.lock().await;
        reap_exited(&mut children);
        children.len()
    }

    pub async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for (session_id, mut child) in children.drain() {
            if let Err(err) = child.kill().await {
                tracing::warn!(session_id = %session_id, error = %err, "failed to kill backend");
            }
        }
    }
}

fn reap_exited(children: &mut HashMap<String, Child>) {
    children.retain(|session_id, child| match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            tracing::info!(
                session_id = %session_id,
                exit_code = ?status.code(),
                "backend exited"
            );
            false
        }
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "failed to poll backend");
            false
        }
    });
}

impl LifecycleManager for ProcessLifecycleManager {
    fn has_running_backend<'a>(&'a self, session_id: &'a str) -> LifecycleFuture<'a, bool> {
        Box::pin(async move {
            let mut children = self.children.lock().await;
            reap_exited(&mut children);
            Ok(children.contains_key(session_id))
        })
    }

    fn start_backend<'a>(&'a self, session_id: &'a str) -> LifecycleFuture<'a, ()> {
        Box::pin(async move {
            let mut children = self.children.lock().await;
            reap_exited(&mut children);
            if children.contains_key(session_id) {
                return Ok(());
            }

            let mut command = Command::new(&self.launch.program);
            command
                .args(&self.launch.args)
                .env("AGENT_SYNC_SESSION_ID", session_id)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            for (key, value) in &self.launch.env {
                command.env(key, value);
            }

            let child = command.spawn().map_err(|err| SyncError::Lifecycle {
                session_id: Some(session_id.to_string()),
                message: format!("failed to spawn {}: {err}", self.launch.program),
            })?;
            tracing::info!(
                session_id = %session_id,
                program = %self.launch.program,
                pid = child.id().unwrap_or(0),
                "backend started"
            );
            children.insert(session_id.to_string(), child);
            Ok(())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn started_backend_reports_running_until_exit() {
        let mut launch = BackendLaunch::new("sh");
        launch.args = vec!["-c".to_string(), "sleep 0.3".to_string()];
        let manager = ProcessLifecycleManager::new(launch);

        assert!(!manager.has_running_backend("ses_1").await.expect("probe"));
        manager.start_backend("ses_1").await.expect("start");
        assert!(manager.has_running_backend("ses_1").await.expect("probe"));

        // A second start while running is a no-op.
        manager.start_backend("ses_1").await.expect("start again");
        assert_eq!(manager.running_count().await, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!manager.has_running_backend("ses_1").await.expect("probe"));
    }

    #[tokio::test]
    async fn missing_program_is_a_lifecycle_error() {
        let manager = ProcessLifecycleManager::new(BackendLaunch::new(
            "/nonexistent/agent-sync-backend",
        ));
        let err = manager.start_backend("ses_1").await.expect_err("spawn fails");
        assert!(matches!(err, SyncError::Lifecycle { .. }));
    }
}
