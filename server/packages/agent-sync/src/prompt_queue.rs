//! Per-host prompt serialization: one prompt in flight, the rest FIFO.
//!
//! Every status change is written to the store, so pending prompts survive a
//! restart and failed ones can be retried.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use agent_sync_error::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::SessionStore;

const FAILED_HISTORY: usize = 100;
const RESTART_ERROR: &str = "resume prompt dropped on restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Pending,
    Sent,
    Failed,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPrompt {
    pub id: String,
    /// Filled in by [`PromptQueue::submit`].
    pub host_id: String,
    pub session_id: String,
    pub content: String,
    /// Asks the agent to continue interrupted work.
    pub resume: bool,
    /// Set once the prompt waited behind another one.
    pub from_queue: bool,
    pub status: PromptStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedPrompt {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("prm_{}", uuid::Uuid::new_v4().simple()),
            host_id: String::new(),
            session_id: session_id.into(),
            content: content.into(),
            resume: false,
            from_queue: false,
            status: PromptStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn resume(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            resume: true,
            ..Self::new(session_id, content)
        }
    }

    fn set_status(&mut self, status: PromptStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.updated_at = Utc::now();
    }

    fn fail(&mut self, err: &DispatchError) {
        self.set_status(PromptStatus::Failed, Some(err.to_string()));
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("host {host_id} is not connected")]
    HostUnavailable { host_id: String },
    #[error("outbound queue full for host {host_id}")]
    QueueFull { host_id: String },
    #[error("dispatch rejected: {message}")]
    Rejected { message: String },
    #[error("prompt record write failed: {message}")]
    Store { message: String },
}

impl From<DispatchError> for SyncError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::HostUnavailable { host_id } => SyncError::HostNotConnected { host_id },
            DispatchError::QueueFull { host_id } => SyncError::QueueFull { host_id },
            DispatchError::Rejected { message } => SyncError::Conflict { message },
            DispatchError::Store { message } => SyncError::store(message),
        }
    }
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;

/// Hands one prompt to a host. Implementations must not call back into the
/// queue.
pub trait PromptDispatch: Send + Sync {
    fn dispatch<'a>(&'a self, host_id: &'a str, prompt: &'a QueuedPrompt) -> DispatchFuture<'a>;
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Dispatched(QueuedPrompt),
    Queued { prompt: QueuedPrompt, position: usize },
}

/// What an abort took off a host's queue.
#[derive(Debug, Default)]
pub struct AbortedPrompts {
    /// The in-flight prompt, failed only when it never reached the host.
    pub undelivered: Option<QueuedPrompt>,
    pub pending: Vec<QueuedPrompt>,
}

impl AbortedPrompts {
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.undelivered.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostQueueSnapshot {
    pub in_flight: Option<QueuedPrompt>,
    pub pending: Vec<QueuedPrompt>,
    pub failed: Vec<QueuedPrompt>,
}

#[derive(Debug, Default)]
struct HostQueue {
    in_flight: Option<QueuedPrompt>,
    pending: VecDeque<QueuedPrompt>,
    failed: VecDeque<QueuedPrompt>,
}

impl HostQueue {
    fn record_failure(&mut self, prompt: QueuedPrompt) {
        self.failed.push_back(prompt);
        while self.failed.len() > FAILED_HISTORY {
            self.failed.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }
}

pub struct PromptQueue {
    dispatcher: Arc<dyn PromptDispatch>,
    store: Arc<dyn SessionStore>,
    hosts: StdMutex<HashMap<String, Arc<Mutex<HostQueue>>>>,
}

impl PromptQueue {
    pub fn new(dispatcher: Arc<dyn PromptDispatch>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            dispatcher,
            store,
            hosts: StdMutex::new(HashMap::new()),
        }
    }

    /// Dispatches immediately when nothing is in flight or waiting for the
    /// host, otherwise appends. The record is written before either happens.
    pub async fn submit(
        &self,
        host_id: &str,
        mut prompt: QueuedPrompt,
    ) -> Result<SubmitOutcome, DispatchError> {
        prompt.host_id = host_id.to_string();
        let queue = self.host_queue(host_id);
        let mut queue = queue.lock().await;

        let idle = queue.is_idle();
        prompt.from_queue = !idle;
        self.store
            .save_prompt(&prompt)
            .await
            .map_err(|err| DispatchError::Store {
                message: err.to_string(),
            })?;

        if !idle {
            queue.pending.push_back(prompt.clone());
            let position = queue.pending.len();
            tracing::info!(
                host_id = %host_id,
                session_id = %prompt.session_id,
                prompt_id = %prompt.id,
                position,
                "host busy; prompt queued"
            );
            return Ok(SubmitOutcome::Queued { prompt, position });
        }

        match self.dispatch_one(host_id, &mut prompt).await {
            Ok(()) => {
                queue.in_flight = Some(prompt.clone());
                Ok(SubmitOutcome::Dispatched(prompt))
            }
            Err(err) => {
                queue.record_failure(prompt);
                Err(err)
            }
        }
    }

    /// Clears the in-flight slot and dispatches the next pending prompt.
    /// Entries that fail to dispatch are marked failed and skipped.
    pub async fn on_host_idle(&self, host_id: &str) -> Option<QueuedPrompt> {
        let queue = self.host_queue(host_id);
        let mut queue = queue.lock().await;
        queue.in_flight = None;
        self.dispatch_next(host_id, &mut queue).await
    }

    /// Drops the in-flight slot and fails everything pending.
    pub async fn abort(&self, host_id: &str) -> AbortedPrompts {
        self.abort_with(host_id, false).await
    }

    /// Like [`PromptQueue::abort`], but the in-flight prompt is failed too.
    /// Used when the host never became ready, so a held prompt never left.
    pub async fn abort_undelivered(&self, host_id: &str) -> AbortedPrompts {
        self.abort_with(host_id, true).await
    }

    /// Moves failed user prompts back to pending and dispatches when the host
    /// is free. Resume prompts are not retried; reconnecting resumes anyway.
    pub async fn retry_failed(&self, host_id: &str) -> usize {
        let queue = self.host_queue(host_id);
        let mut queue = queue.lock().await;

        let (retry, keep): (Vec<QueuedPrompt>, Vec<QueuedPrompt>) =
            queue.failed.drain(..).partition(|prompt| !prompt.resume);
        queue.failed = keep.into();
        let retried = retry.len();
        for mut prompt in retry {
            prompt.set_status(PromptStatus::Pending, None);
            prompt.from_queue = true;
            self.persist(&prompt).await;
            queue.pending.push_back(prompt);
        }
        if retried > 0 {
            tracing::info!(host_id = %host_id, retried, "retrying failed prompts");
        }
        if queue.in_flight.is_none() {
            self.dispatch_next(host_id, &mut queue).await;
        }
        retried
    }

    /// Rebuilds per-host queues from the store after a restart.
    ///
    /// Pending user prompts wait for their host's `host_ready`. Pending resume
    /// prompts are stale by then and are failed. Returns how many prompts
    /// were queued again.
    pub async fn restore(&self) -> Result<usize, SyncError> {
        let failed = self.store.list_prompts_by_status(PromptStatus::Failed).await?;
        let pending = self.store.list_prompts_by_status(PromptStatus::Pending).await?;

        for prompt in failed {
            let queue = self.host_queue(&prompt.host_id);
            queue.lock().await.record_failure(prompt);
        }

        let mut restored = 0;
        for mut prompt in pending {
            let queue = self.host_queue(&prompt.host_id);
            let mut queue = queue.lock().await;
            if prompt.resume {
                prompt.set_status(PromptStatus::Failed, Some(RESTART_ERROR.to_string()));
                self.persist(&prompt).await;
                queue.record_failure(prompt);
                continue;
            }
            queue.pending.push_back(prompt);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(restored, "restored pending prompts");
        }
        Ok(restored)
    }

    pub async fn is_busy(&self, host_id: &str) -> bool {
        match self.existing_queue(host_id) {
            Some(queue) => queue.lock().await.in_flight.is_some(),
            None => false,
        }
    }

    /// Session whose prompt currently occupies the host, if any.
    pub async fn in_flight_session(&self, host_id: &str) -> Option<String> {
        let queue = self.existing_queue(host_id)?;
        let queue = queue.lock().await;
        queue
            .in_flight
            .as_ref()
            .map(|prompt| prompt.session_id.clone())
    }

    pub async fn snapshot(&self, host_id: &str) -> HostQueueSnapshot {
        let Some(queue) = self.existing_queue(host_id) else {
            return HostQueueSnapshot::default();
        };
        let queue = queue.lock().await;
        HostQueueSnapshot {
            in_flight: queue.in_flight.clone(),
            pending: queue.pending.iter().cloned().collect(),
            failed: queue.failed.iter().cloned().collect(),
        }
    }

    async fn abort_with(&self, host_id: &str, include_in_flight: bool) -> AbortedPrompts {
        let Some(queue) = self.existing_queue(host_id) else {
            return AbortedPrompts::default();
        };
        let mut queue = queue.lock().await;
        let err = DispatchError::HostUnavailable {
            host_id: host_id.to_string(),
        };

        let mut aborted = AbortedPrompts::default();
        if let Some(mut prompt) = queue.in_flight.take().filter(|_| include_in_flight) {
            prompt.fail(&err);
            self.persist(&prompt).await;
            aborted.undelivered = Some(prompt.clone());
            queue.record_failure(prompt);
        }
        while let Some(mut prompt) = queue.pending.pop_front() {
            prompt.fail(&err);
            self.persist(&prompt).await;
            aborted.pending.push(prompt.clone());
            queue.record_failure(prompt);
        }
        if !aborted.is_empty() {
            tracing::info!(
                host_id = %host_id,
                aborted = aborted.len(),
                "aborted prompts for disconnected host"
            );
        }
        aborted
    }

    async fn dispatch_next(&self, host_id: &str, queue: &mut HostQueue) -> Option<QueuedPrompt> {
        while let Some(mut prompt) = queue.pending.pop_front() {
            if self.dispatch_one(host_id, &mut prompt).await.is_ok() {
                tracing::info!(
                    host_id = %host_id,
                    session_id = %prompt.session_id,
                    prompt_id = %prompt.id,
                    remaining = queue.pending.len(),
                    "dispatched queued prompt"
                );
                queue.in_flight = Some(prompt.clone());
                return Some(prompt);
            }
            queue.record_failure(prompt);
        }
        None
    }

    /// Hands the prompt to the dispatcher and records the outcome.
    async fn dispatch_one(
        &self,
        host_id: &str,
        prompt: &mut QueuedPrompt,
    ) -> Result<(), DispatchError> {
        let result = self.dispatcher.dispatch(host_id, prompt).await;
        match &result {
            Ok(()) => prompt.set_status(PromptStatus::Sent, None),
            Err(err) => {
                tracing::warn!(
                    host_id = %host_id,
                    session_id = %prompt.session_id,
                    prompt_id = %prompt.id,
                    error = %err,
                    "prompt dispatch failed"
                );
                prompt.fail(err);
            }
        }
        self.persist(prompt).await;
        result
    }

    async fn persist(&self, prompt: &QueuedPrompt) {
        if let Err(err) = self.store.save_prompt(prompt).await {
            tracing::warn!(
                prompt_id = %prompt.id,
                status = prompt.status.as_str(),
                error = %err,
                "prompt record write failed"
            );
        }
    }

    fn host_queue(&self, host_id: &str) -> Arc<Mutex<HostQueue>> {
        match self.hosts.lock() {
            Ok(mut hosts) => hosts.entry(host_id.to_string()).or_default().clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(host_id.to_string())
                .or_default()
                .clone(),
        }
    }

    fn existing_queue(&self, host_id: &str) -> Option<Arc<Mutex<HostQueue>>> {
        self.hosts
            .lock()
            .ok()
            .and_then(|hosts| hosts.get(host_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: StdMutex<Vec<(String, String)>>,
        reject: AtomicBool,
    }

    impl RecordingDispatcher {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("sent lock").clone()
        }

        fn contents(&self) -> Vec<String> {
            self.sent().into_iter().map(|(_, content)| content).collect()
        }
    }

    impl PromptDispatch for RecordingDispatcher {
        fn dispatch<'a>(
            &'a self,
            host_id: &'a str,
            prompt: &'a QueuedPrompt,
        ) -> DispatchFuture<'a> {
            Box::pin(async move {
                if self.reject.load(Ordering::SeqCst) {
                    return Err(DispatchError::QueueFull {
                        host_id: host_id.to_string(),
                    });
                }
                self.sent
                    .lock()
                    .expect("sent lock")
                    .push((host_id.to_string(), prompt.content.clone()));
                Ok(())
            })
        }
    }

    fn queue() -> (Arc<RecordingDispatcher>, Arc<MemorySessionStore>, PromptQueue) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = Arc::new(MemorySessionStore::new());
        let queue = PromptQueue::new(dispatcher.clone(), store.clone());
        (dispatcher, store, queue)
    }

    async fn stored(store: &MemorySessionStore, status: PromptStatus) -> Vec<String> {
        store
            .list_prompts_by_status(status)
            .await
            .expect("list prompts")
            .into_iter()
            .map(|prompt| prompt.content)
            .collect()
    }

    #[tokio::test]
    async fn busy_host_queues_second_prompt() {
        let (dispatcher, store, queue) = queue();

        let first = queue
            .submit("host-a", QueuedPrompt::new("ses_1", "first"))
            .await
            .expect("first");
        assert!(matches!(first, SubmitOutcome::Dispatched(_)));

        let second = queue
            .submit("host-a", QueuedPrompt::new("ses_2", "second"))
            .await
            .expect("second");
        match second {
            SubmitOutcome::Queued { prompt, position } => {
                assert_eq!(position, 1);
                assert!(prompt.from_queue);
                assert_eq!(prompt.host_id, "host-a");
            }
            other => panic!("expected queued, got {other:?}"),
        }
        assert_eq!(dispatcher.sent().len(), 1);
        assert_eq!(stored(&store, PromptStatus::Sent).await, vec!["first"]);
        assert_eq!(stored(&store, PromptStatus::Pending).await, vec!["second"]);

        let next = queue.on_host_idle("host-a").await.expect("dispatched");
        assert_eq!(next.content, "second");
        assert_eq!(
            dispatcher.sent(),
            vec![
                ("host-a".to_string(), "first".to_string()),
                ("host-a".to_string(), "second".to_string())
            ]
        );
        assert!(queue.is_busy("host-a").await);
        assert!(stored(&store, PromptStatus::Pending).await.is_empty());

        assert!(queue.on_host_idle("host-a").await.is_none());
        assert!(!queue.is_busy("host-a").await);
    }

    #[tokio::test]
    async fn hosts_are_independent() {
        let (dispatcher, _store, queue) = queue();
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "a"))
            .await
            .expect("a");
        let outcome = queue
            .submit("host-b", QueuedPrompt::new("ses_2", "b"))
            .await
            .expect("b");
        assert!(matches!(outcome, SubmitOutcome::Dispatched(_)));
        assert_eq!(dispatcher.sent().len(), 2);
    }

    #[tokio::test]
    async fn failed_prompt_can_be_retried() {
        let (dispatcher, store, queue) = queue();
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "first"))
            .await
            .expect("first");
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "second"))
            .await
            .expect("queued");

        dispatcher.reject.store(true, Ordering::SeqCst);
        assert!(queue.on_host_idle("host-a").await.is_none());

        let snapshot = queue.snapshot("host-a").await;
        assert!(snapshot.in_flight.is_none());
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(snapshot.failed[0].status, PromptStatus::Failed);
        assert_eq!(stored(&store, PromptStatus::Failed).await, vec!["second"]);

        dispatcher.reject.store(false, Ordering::SeqCst);
        assert_eq!(queue.retry_failed("host-a").await, 1);
        assert_eq!(dispatcher.contents(), vec!["first", "second"]);
        let snapshot = queue.snapshot("host-a").await;
        assert!(snapshot.failed.is_empty());
        let in_flight = snapshot.in_flight.expect("in flight");
        assert_eq!(in_flight.status, PromptStatus::Sent);
        assert_eq!(in_flight.error, None);
        assert!(stored(&store, PromptStatus::Failed).await.is_empty());
    }

    #[tokio::test]
    async fn retry_waits_behind_in_flight_prompt() {
        let (dispatcher, _store, queue) = queue();
        dispatcher.reject.store(true, Ordering::SeqCst);
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "lost"))
            .await
            .expect_err("rejected");
        queue
            .submit("host-a", QueuedPrompt::resume("ses_2", "continue"))
            .await
            .expect_err("rejected");
        dispatcher.reject.store(false, Ordering::SeqCst);
        queue
            .submit("host-a", QueuedPrompt::new("ses_3", "busy"))
            .await
            .expect("busy");

        assert_eq!(queue.retry_failed("host-a").await, 1);
        let snapshot = queue.snapshot("host-a").await;
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].content, "lost");
        assert_eq!(snapshot.failed.len(), 1, "resume prompts stay failed");
        assert!(snapshot.failed[0].resume);
        assert_eq!(dispatcher.contents(), vec!["busy"]);
    }

    #[tokio::test]
    async fn immediate_dispatch_failure_is_returned() {
        let (dispatcher, store, queue) = queue();
        dispatcher.reject.store(true, Ordering::SeqCst);
        let err = queue
            .submit("host-a", QueuedPrompt::new("ses_1", "first"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, DispatchError::QueueFull { .. }));
        assert!(!queue.is_busy("host-a").await);
        assert_eq!(stored(&store, PromptStatus::Failed).await, vec!["first"]);
    }

    #[tokio::test]
    async fn unrecorded_prompt_is_not_dispatched() {
        let (dispatcher, store, queue) = queue();
        store.set_fail_writes(true);
        let err = queue
            .submit("host-a", QueuedPrompt::new("ses_1", "first"))
            .await
            .expect_err("store down");
        assert!(matches!(err, DispatchError::Store { .. }));
        assert!(dispatcher.sent().is_empty());
        assert!(!queue.is_busy("host-a").await);
    }

    #[tokio::test]
    async fn restored_prompts_keep_their_place() {
        let store = Arc::new(MemorySessionStore::new());
        let mut waiting = QueuedPrompt::new("ses_1", "waiting");
        waiting.host_id = "host-a".to_string();
        let mut stale_resume = QueuedPrompt::resume("ses_2", "continue");
        stale_resume.host_id = "host-a".to_string();
        let mut failed = QueuedPrompt::new("ses_3", "failed earlier");
        failed.host_id = "host-a".to_string();
        failed.set_status(PromptStatus::Failed, Some("host gone".to_string()));
        for prompt in [&waiting, &stale_resume, &failed] {
            store.save_prompt(prompt).await.expect("seed");
        }

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let queue = PromptQueue::new(dispatcher.clone(), store.clone());
        assert_eq!(queue.restore().await.expect("restore"), 1);

        let snapshot = queue.snapshot("host-a").await;
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].id, waiting.id);
        assert_eq!(snapshot.failed.len(), 2);
        let mut failed_records = stored(&store, PromptStatus::Failed).await;
        failed_records.sort();
        assert_eq!(failed_records, vec!["continue", "failed earlier"]);

        let later = queue
            .submit("host-a", QueuedPrompt::new("ses_4", "later"))
            .await
            .expect("later");
        assert!(matches!(later, SubmitOutcome::Queued { position: 2, .. }));
        assert!(dispatcher.sent().is_empty());

        queue.on_host_idle("host-a").await;
        queue.on_host_idle("host-a").await;
        assert_eq!(dispatcher.contents(), vec!["waiting", "later"]);
    }

    #[tokio::test]
    async fn abort_fails_pending_and_frees_host() {
        let (_dispatcher, store, queue) = queue();
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "first"))
            .await
            .expect("first");
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "second"))
            .await
            .expect("second");

        let aborted = queue.abort("host-a").await;
        assert_eq!(aborted.len(), 1);
        assert!(aborted.undelivered.is_none());
        assert_eq!(aborted.pending[0].status, PromptStatus::Failed);
        assert!(!queue.is_busy("host-a").await);
        assert_eq!(stored(&store, PromptStatus::Sent).await, vec!["first"]);
        assert_eq!(stored(&store, PromptStatus::Failed).await, vec!["second"]);
    }

    #[tokio::test]
    async fn undelivered_abort_fails_held_prompt() {
        let (_dispatcher, store, queue) = queue();
        queue
            .submit("host-a", QueuedPrompt::new("ses_1", "held"))
            .await
            .expect("held");

        let aborted = queue.abort_undelivered("host-a").await;
        assert_eq!(aborted.len(), 1);
        let held = aborted.undelivered.expect("held prompt");
        assert_eq!(held.content, "held");
        assert_eq!(held.status, PromptStatus::Failed);
        let snapshot = queue.snapshot("host-a").await;
        assert!(snapshot.in_flight.is_none());
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(stored(&store, PromptStatus::Failed).await, vec!["held"]);
    }
}
