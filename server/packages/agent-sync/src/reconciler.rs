//! Periodic desired-state pass and the resume decision on `host_ready`.
//!
//! Whether a reconnected host gets a continue prompt depends on the
//! session's work state: `working` is resumed, `idle` and `done` are not.
//! A `stopped` session is never resumed, even when the host names it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agent_sync_error::SyncError;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::accumulator::StreamingAccumulator;
use crate::lifecycle::LifecycleManager;
use crate::model::{DesiredState, Session, WorkState};
use crate::prompt_queue::QueuedPrompt;
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartState {
    InFlight,
    Requested(Instant),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub checked: usize,
    pub restarts_requested: usize,
    pub restarts_pending: usize,
    pub probe_failures: usize,
    pub flushed: usize,
}

pub fn needs_resume(session: &Session) -> bool {
    session.work_state == WorkState::Working
}

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    lifecycle: Option<Arc<dyn LifecycleManager>>,
    accumulator: Arc<StreamingAccumulator>,
    restart_grace: Duration,
    resume_guidance: String,
    restarts: Arc<StdMutex<HashMap<String, RestartState>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lifecycle: Option<Arc<dyn LifecycleManager>>,
        accumulator: Arc<StreamingAccumulator>,
        restart_grace: Duration,
        resume_guidance: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            accumulator,
            restart_grace,
            resume_guidance: resume_guidance.into(),
            restarts: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn resume_prompt(&self, session: &Session) -> QueuedPrompt {
        QueuedPrompt::resume(session.id.clone(), self.resume_guidance.clone())
    }

    /// Sessions on `host_id` that were mid-turn and need a continue prompt.
    pub async fn resume_candidates(
        &self,
        host_id: &str,
        resumed: Option<Session>,
    ) -> Result<Vec<Session>, SyncError> {
        let mut candidates: Vec<Session> = self
            .store
            .list_sessions_by_desired_state(DesiredState::Running)
            .await?
            .into_iter()
            .filter(|session| session.host_id.as_deref() == Some(host_id))
            .filter(needs_resume)
            .collect();
        if let Some(session) = resumed {
            if session.desired_state == DesiredState::Running
                && needs_resume(&session)
                && !candidates.iter().any(|c| c.id == session.id)
            {
                candidates.push(session);
            }
        }
        Ok(candidates)
    }

    /// One idempotent pass: flush stale streaming state, then make sure every
    /// `running` session has a backend. Restarts are fire-and-forget.
    pub async fn run_pass(&self) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport {
            flushed: self.accumulator.flush_stale().await,
            ..ReconcileReport::default()
        };

        let Some(lifecycle) = self.lifecycle.clone() else {
            return Ok(report);
        };

        let sessions = self
            .store
            .list_sessions_by_desired_state(DesiredState::Running)
            .await?;
        let now = Instant::now();
        for session in sessions {
            report.checked += 1;
            if self.restart_pending(&session.id, now) {
                report.restarts_pending += 1;
                continue;
            }

            match lifecycle.has_running_backend(&session.id).await {
                Ok(true) => self.clear_restart(&session.id),
                Ok(false) => {
                    self.request_restart(lifecycle.clone(), session.id.clone());
                    report.restarts_requested += 1;
                }
                Err(err) => {
                    report.probe_failures += 1;
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "backend probe failed"
                    );
                }
            }
        }

        if report.restarts_requested > 0 || report.probe_failures > 0 {
            tracing::info!(
                checked = report.checked,
                restarts_requested = report.restarts_requested,
                probe_failures = report.probe_failures,
                "reconcile pass finished"
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_pass().await {
                    tracing::warn!(error = %err, "reconcile pass failed");
                }
            }
        })
    }

    fn restart_pending(&self, session_id: &str, now: Instant) -> bool {
        let Ok(mut restarts) = self.restarts.lock() else {
            return false;
        };
        match restarts.get(session_id).copied() {
            Some(RestartState::InFlight) => true,
            Some(RestartState::Requested(at)) => {
                if now.saturating_duration_since(at) < self.restart_grace {
                    true
                } else {
                    restarts.remove(session_id);
                    false
                }
            }
            None => false,
        }
    }

    fn clear_restart(&self, session_id: &str) {
        if let Ok(mut restarts) = self.restarts.lock() {
            restarts.remove(session_id);
        }
    }

    fn request_restart(&self, lifecycle: Arc<dyn LifecycleManager>, session_id: String) {
        if let Ok(mut restarts) = self.restarts.lock() {
            restarts.insert(session_id.clone(), RestartState::InFlight);
        }
        tracing::info!(session_id = %session_id, "backend missing; requesting start");

        let restarts = self.restarts.clone();
        tokio::spawn(async move {
            let result = lifecycle.start_backend(&session_id).await;
            let Ok(mut restarts) = restarts.lock() else {
                return;
            };
            match result {
                Ok(()) => {
                    restarts.insert(session_id, RestartState::Requested(Instant::now()));
                }
                Err(err) => {
                    restarts.remove(&session_id);
                    tracing::error!(
                        session_id = %session_id,
                        error = %err,
                        "backend start failed; will retry next pass"
                    );
                }
            }
        });
    }
}
