//! The sync engine: per-host workers, inbound event handling, and the
//! session operations the HTTP surface exposes.
//!
//! Each connected host gets one worker task that drains its inbound events
//! in order. Hosts never share a worker, so ordering holds per host while
//! hosts run in parallel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agent_sync_error::SyncError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::accumulator::{ChunkUpdate, StreamingAccumulator};
use crate::config::SyncConfig;
use crate::lifecycle::LifecycleManager;
use crate::mapping::{MappingResolver, ThreadRef};
use crate::model::{
    new_interaction_id, new_request_id, new_session_id, DesiredState, Interaction, Session,
    WorkState, DEFAULT_THREAD_TITLE,
};
use crate::prompt_queue::{
    AbortedPrompts, DispatchError, DispatchFuture, HostQueueSnapshot, PromptDispatch, PromptQueue,
    QueuedPrompt, SubmitOutcome,
};
use crate::protocol::{Command, SyncEvent};
use crate::publisher::{Publisher, SequencedEvent};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{
    AgentConnection, ConnectionInfo, ConnectionRegistry, EnqueueError, EnqueueOutcome, Readiness,
    ReadyError,
};
use crate::store::{require_session, SessionStore};

const SUPERSEDED_ERROR: &str = "superseded by a new prompt";
const UNDELIVERED_ERROR: &str = "host disconnected before the prompt was delivered";

/// Parameters for creating a session bound to a host.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub host_id: String,
    pub name: Option<String>,
    pub group_id: Option<String>,
    pub agent_thread_id: Option<String>,
}

/// Everything a socket driver needs for one accepted host connection.
#[derive(Debug)]
pub struct HostSession {
    pub connection: Arc<AgentConnection>,
    pub outbound: mpsc::Receiver<Command>,
    pub inbound: mpsc::Sender<SyncEvent>,
}

/// Turns a queued prompt into an interaction plus a `submit_prompt` command.
struct EngineDispatcher {
    store: Arc<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<MappingResolver>,
    publisher: Arc<Publisher>,
    accumulator: Arc<StreamingAccumulator>,
}

fn rejected(err: SyncError) -> DispatchError {
    DispatchError::Rejected {
        message: err.to_string(),
    }
}

impl EngineDispatcher {
    async fn dispatch_prompt(
        &self,
        host_id: &str,
        prompt: &QueuedPrompt,
    ) -> Result<(), DispatchError> {
        if !self.registry.is_connected(host_id) {
            return Err(DispatchError::HostUnavailable {
                host_id: host_id.to_string(),
            });
        }

        let mut session = require_session(self.store.as_ref(), &prompt.session_id)
            .await
            .map_err(rejected)?;
        if session.work_state == WorkState::Done {
            return Err(DispatchError::Rejected {
                message: format!("session {} is finished", session.id),
            });
        }
        let request_id = new_request_id();
        let interaction = self
            .prepare_interaction(&session, prompt, &request_id)
            .await
            .map_err(rejected)?;

        session.work_state = WorkState::Working;
        session.active_request_id = Some(request_id.clone());
        session.current_interaction_id = Some(interaction.id.clone());
        session.host_id = Some(host_id.to_string());
        session.touch();
        self.store.update_session(&session).await.map_err(rejected)?;
        self.resolver.record_request(&request_id, &session.id);

        let command = Command::SubmitPrompt {
            thread_id: session.agent_thread_id.clone(),
            content: prompt.content.clone(),
            request_id: request_id.clone(),
            resume: prompt.resume,
            agent_name: None,
        };
        match self.registry.enqueue(host_id, command) {
            Ok(outcome) => {
                tracing::info!(
                    host_id = %host_id,
                    session_id = %session.id,
                    interaction_id = %interaction.id,
                    request_id = %request_id,
                    resume = prompt.resume,
                    held = outcome == EnqueueOutcome::Queued,
                    "prompt dispatched"
                );
                self.publisher.session_updated(&session);
                Ok(())
            }
            Err(err) => {
                self.roll_back(session, &err.to_string()).await;
                Err(match err {
                    EnqueueError::QueueFull { host_id } => DispatchError::QueueFull { host_id },
                    EnqueueError::NotFound { host_id } => {
                        DispatchError::HostUnavailable { host_id }
                    }
                })
            }
        }
    }

    /// Reuses the open interaction for a resume prompt; otherwise closes any
    /// stale open interaction and starts a fresh one.
    ///
    /// A turn that completed while the store was failing is written out
    /// first, so it keeps its response and carries no error.
    async fn prepare_interaction(
        &self,
        session: &Session,
        prompt: &QueuedPrompt,
        request_id: &str,
    ) -> Result<Interaction, SyncError> {
        if self.accumulator.flush_completed(&session.id).await? {
            tracing::debug!(
                session_id = %session.id,
                "flushed completed interaction before new prompt"
            );
        }
        if let Some(open) = self.open_interaction(session).await? {
            if prompt.resume {
                tracing::debug!(
                    session_id = %session.id,
                    interaction_id = %open.id,
                    "resume prompt attaches to open interaction"
                );
                return Ok(open);
            }
            tracing::info!(
                session_id = %session.id,
                interaction_id = %open.id,
                "closing stale open interaction"
            );
            self.accumulator
                .on_failed(&session.id, SUPERSEDED_ERROR.to_string())
                .await?;
        }

        let interaction = Interaction::new(
            new_interaction_id(),
            session.id.clone(),
            prompt.content.clone(),
            Some(request_id.to_string()),
        );
        self.store.insert_interaction(&interaction).await?;
        self.publisher.interaction_created(&interaction);
        Ok(interaction)
    }

    async fn open_interaction(&self, session: &Session) -> Result<Option<Interaction>, SyncError> {
        let Some(interaction_id) = session.current_interaction_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_interaction(interaction_id)
            .await?
            .filter(|interaction| !interaction.completed))
    }

    /// Undoes a dispatch the host never received: closes the interaction with
    /// `reason` and returns a working session to `idle`.
    async fn roll_back(&self, mut session: Session, reason: &str) {
        if let Some(request_id) = session.active_request_id.take() {
            self.resolver.forget_request(&request_id);
        }
        if let Err(close_err) = self.accumulator.on_failed(&session.id, reason.to_string()).await {
            tracing::warn!(
                session_id = %session.id,
                error = %close_err,
                "failed to close interaction after dispatch failure"
            );
        }
        if session.work_state == WorkState::Working {
            session.work_state = WorkState::Idle;
        }
        session.touch();
        match self.store.update_session(&session).await {
            Ok(()) => self.publisher.session_updated(&session),
            Err(update_err) => tracing::warn!(
                session_id = %session.id,
                error = %update_err,
                "failed to reset session after dispatch failure"
            ),
        }
    }
}

impl PromptDispatch for EngineDispatcher {
    fn dispatch<'a>(&'a self, host_id: &'a str, prompt: &'a QueuedPrompt) -> DispatchFuture<'a> {
        Box::pin(self.dispatch_prompt(host_id, prompt))
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<MappingResolver>,
    publisher: Arc<Publisher>,
    accumulator: Arc<StreamingAccumulator>,
    dispatcher: Arc<EngineDispatcher>,
    prompts: Arc<PromptQueue>,
    reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("hosts", &self.registry.list().len())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SessionStore>,
        lifecycle: Option<Arc<dyn LifecycleManager>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.queue_capacity));
        let resolver = Arc::new(MappingResolver::new(store.clone()));
        let publisher = Arc::new(Publisher::new(config.subscriber_buffer));
        let accumulator = Arc::new(StreamingAccumulator::new(
            store.clone(),
            publisher.clone(),
            config.throttle,
        ));
        let dispatcher = Arc::new(EngineDispatcher {
            store: store.clone(),
            registry: registry.clone(),
            resolver: resolver.clone(),
            publisher: publisher.clone(),
            accumulator: accumulator.clone(),
        });
        let prompts = Arc::new(PromptQueue::new(dispatcher.clone(), store.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            lifecycle,
            accumulator.clone(),
            config.restart_grace,
            config.resume_guidance.clone(),
        ));
        Arc::new(Self {
            config,
            store,
            registry,
            resolver,
            publisher,
            accumulator,
            dispatcher,
            prompts,
            reconciler,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &MappingResolver {
        &self.resolver
    }

    pub fn accumulator(&self) -> &StreamingAccumulator {
        &self.accumulator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.publisher.subscribe()
    }

    /// Registers a host connection, starts its worker and its ready watchdog.
    pub fn connect_host(self: &Arc<Self>, host_id: &str) -> HostSession {
        let handle = self.registry.register(host_id);
        let connection = handle.connection;
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<SyncEvent>(self.config.queue_capacity);
        tracing::info!(
            host_id = %host_id,
            connection_id = %connection.connection_id(),
            "host connected"
        );

        let engine = self.clone();
        let worker_host = host_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                let kind = event.kind();
                if let Err(err) = engine.handle_event(&worker_host, event).await {
                    tracing::warn!(
                        host_id = %worker_host,
                        event = kind,
                        error = %err,
                        "event handling failed"
                    );
                }
            }
            tracing::debug!(host_id = %worker_host, "host worker stopped");
        });

        let engine = self.clone();
        let watched = connection.clone();
        let ready_timeout = self.config.ready_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ready_timeout) => {
                    if engine.registry.expire_if_not_ready(&watched) {
                        engine.abort_prompts(&watched).await;
                    }
                }
                _ = watched.closed() => {}
            }
        });

        HostSession {
            connection,
            outbound: handle.outbound,
            inbound: inbound_tx,
        }
    }

    /// Drops a connection and aborts its prompt queue. Sessions keep their
    /// state unless their prompt was still held for an unready host.
    pub async fn disconnect_host(&self, connection: &AgentConnection) {
        if !self.registry.release(connection) {
            tracing::debug!(
                host_id = %connection.host_id(),
                connection_id = %connection.connection_id(),
                "stale connection closed"
            );
            return;
        }
        let aborted = self.abort_prompts(connection).await;
        tracing::info!(
            host_id = %connection.host_id(),
            aborted = aborted.len(),
            "host disconnected"
        );
    }

    /// Fails the host's queued prompts. A host that never became ready also
    /// loses its held prompt, whose session is rolled back.
    async fn abort_prompts(&self, connection: &AgentConnection) -> AbortedPrompts {
        let host_id = connection.host_id();
        if connection.readiness() == Readiness::Ready {
            return self.prompts.abort(host_id).await;
        }
        let aborted = self.prompts.abort_undelivered(host_id).await;
        if let Some(held) = aborted.undelivered.as_ref().filter(|held| !held.resume) {
            match self.store.get_session(&held.session_id).await {
                Ok(Some(session)) => self.dispatcher.roll_back(session, UNDELIVERED_ERROR).await,
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    session_id = %held.session_id,
                    error = %err,
                    "failed to load session for undelivered prompt"
                ),
            }
        }
        aborted
    }

    /// Closes every host socket. Queued prompts keep their stored status and
    /// come back through [`SyncEngine::restore_prompts`] on the next start.
    pub fn close_hosts(&self) -> usize {
        let closed = self
            .registry
            .list()
            .iter()
            .filter(|host| self.registry.deregister(&host.host_id).is_some())
            .count();
        tracing::info!(closed, "closed host connections");
        closed
    }

    pub async fn handle_event(&self, host_id: &str, event: SyncEvent) -> Result<(), SyncError> {
        tracing::debug!(host_id = %host_id, event = event.kind(), "inbound event");
        match event {
            SyncEvent::HostReady {
                host_id: claimed,
                resumed_thread_id,
            } => {
                if let Some(claimed) = claimed.as_deref().filter(|claimed| *claimed != host_id) {
                    tracing::warn!(
                        host_id = %host_id,
                        claimed = %claimed,
                        "host_ready identity differs from connection"
                    );
                }
                self.on_host_ready(host_id, resumed_thread_id.as_deref())
                    .await
            }
            SyncEvent::ThreadCreated {
                request_id,
                thread_id,
                group_id,
                title,
            } => {
                let resolution = self
                    .resolver
                    .resolve(
                        ThreadRef::new(host_id, &thread_id)
                            .with_request(request_id.as_deref())
                            .with_group(group_id.as_deref())
                            .with_title(title.as_deref()),
                    )
                    .await?;
                tracing::info!(
                    host_id = %host_id,
                    thread_id = %thread_id,
                    session_id = %resolution.session.id,
                    resolved_by = ?resolution.resolved_by,
                    "thread created"
                );
                if resolution.session_changed() {
                    self.publisher.session_updated(&resolution.session);
                }
                Ok(())
            }
            SyncEvent::ResponseChunk {
                thread_id,
                content,
                request_id,
                message_id,
            } => {
                let resolution = self
                    .resolver
                    .resolve(
                        ThreadRef::new(host_id, &thread_id).with_request(request_id.as_deref()),
                    )
                    .await?;
                if resolution.session_changed() {
                    self.publisher.session_updated(&resolution.session);
                }
                let update = ChunkUpdate {
                    content: &content,
                    segment_key: message_id.as_deref(),
                    request_id: request_id.as_deref(),
                };
                self.accumulator
                    .on_chunk(&resolution.session.id, update)
                    .await
            }
            SyncEvent::ResponseComplete {
                thread_id,
                request_id,
            } => {
                let Some(session) = self
                    .find_session(&thread_id, request_id.as_deref())
                    .await?
                else {
                    tracing::debug!(
                        host_id = %host_id,
                        thread_id = %thread_id,
                        "completion for unknown thread ignored"
                    );
                    return Ok(());
                };
                self.complete_turn(host_id, session, request_id.as_deref(), None)
                    .await
            }
            SyncEvent::UserInitiatedThread { thread_id, title } => {
                let resolution = self
                    .resolver
                    .resolve(
                        ThreadRef::user_initiated(host_id, &thread_id)
                            .with_title(title.as_deref()),
                    )
                    .await?;
                if resolution.created() {
                    self.publisher.session_updated(&resolution.session);
                    return Ok(());
                }
                let mut session = resolution.session;
                if session.host_id.as_deref() != Some(host_id) {
                    session.host_id = Some(host_id.to_string());
                    session.touch();
                    self.store.update_session(&session).await?;
                    self.publisher.session_updated(&session);
                }
                Ok(())
            }
            SyncEvent::ThreadRenamed { thread_id, title } => {
                let resolution = self
                    .resolver
                    .resolve(ThreadRef::new(host_id, &thread_id).with_title(Some(title.as_str())))
                    .await?;
                let mut session = resolution.session;
                if session.name != title {
                    session.name = title;
                    session.touch();
                    self.store.update_session(&session).await?;
                }
                self.publisher.session_updated(&session);
                Ok(())
            }
            SyncEvent::ThreadLoadFailed {
                thread_id,
                error,
                request_id,
            } => {
                let Some(session) = self
                    .find_session(&thread_id, request_id.as_deref())
                    .await?
                else {
                    tracing::warn!(
                        host_id = %host_id,
                        thread_id = %thread_id,
                        error = %error,
                        "load failure for unknown thread ignored"
                    );
                    return Ok(());
                };
                tracing::warn!(
                    host_id = %host_id,
                    thread_id = %thread_id,
                    session_id = %session.id,
                    error = %error,
                    "thread load failed"
                );
                self.complete_turn(
                    host_id,
                    session,
                    request_id.as_deref(),
                    Some(format!("Thread load failed: {error}")),
                )
                .await
            }
        }
    }

    /// Flushes held commands, then nudges sessions that were mid-turn.
    ///
    /// A session whose prompt was just flushed from the pre-ready buffer is
    /// already being served and gets no resume prompt.
    async fn on_host_ready(
        &self,
        host_id: &str,
        resumed_thread_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let flushed = match self.registry.mark_ready(host_id) {
            Ok(flushed) => flushed,
            Err(ReadyError::AlreadyReady { .. }) => {
                tracing::info!(host_id = %host_id, "duplicate host_ready ignored");
                return Ok(());
            }
            Err(ReadyError::NotFound { .. }) => {
                tracing::warn!(host_id = %host_id, "host_ready for unregistered host");
                return Ok(());
            }
        };
        let flushed_requests: HashSet<&str> =
            flushed.iter().filter_map(Command::request_id).collect();

        let mut served: HashSet<String> = HashSet::new();
        if flushed_requests.is_empty() {
            if let Some(next) = self.prompts.on_host_idle(host_id).await {
                served.insert(next.session_id);
            }
        }

        let resumed = match resumed_thread_id {
            Some(thread_id) => self.resolver.lookup(thread_id).await?,
            None => None,
        };
        let candidates = self.reconciler.resume_candidates(host_id, resumed).await?;
        for session in candidates {
            let flushed_here = session
                .active_request_id
                .as_deref()
                .map(|request_id| flushed_requests.contains(request_id))
                .unwrap_or(false);
            if flushed_here || served.contains(&session.id) {
                tracing::debug!(
                    host_id = %host_id,
                    session_id = %session.id,
                    "prompt already delivered; no resume"
                );
                continue;
            }
            let prompt = self.reconciler.resume_prompt(&session);
            match self.prompts.submit(host_id, prompt).await {
                Ok(_) => tracing::info!(
                    host_id = %host_id,
                    session_id = %session.id,
                    "resume prompt submitted"
                ),
                Err(err) => tracing::warn!(
                    host_id = %host_id,
                    session_id = %session.id,
                    error = %err,
                    "resume prompt failed"
                ),
            }
        }
        Ok(())
    }

    async fn find_session(
        &self,
        thread_id: &str,
        request_id: Option<&str>,
    ) -> Result<Option<Session>, SyncError> {
        if let Some(session_id) = request_id.and_then(|id| self.resolver.session_for_request(id)) {
            if let Some(session) = self.store.get_session(&session_id).await? {
                return Ok(Some(session));
            }
        }
        self.resolver.lookup(thread_id).await
    }

    /// Closes the session's turn: final flush, `working` back to `idle`,
    /// correlation cleanup, and the next queued prompt for the host.
    async fn complete_turn(
        &self,
        host_id: &str,
        mut session: Session,
        request_id: Option<&str>,
        error: Option<String>,
    ) -> Result<(), SyncError> {
        if let (Some(event_request), Some(active)) =
            (request_id, session.active_request_id.as_deref())
        {
            if event_request != active {
                tracing::debug!(
                    session_id = %session.id,
                    request_id = %event_request,
                    active_request_id = %active,
                    "completion for a superseded request ignored"
                );
                self.resolver.forget_request(event_request);
                return Ok(());
            }
        }

        let completed = match error {
            Some(error) => self.accumulator.on_failed(&session.id, error).await?,
            None => self.accumulator.on_complete(&session.id, None).await?,
        };
        if completed.is_none()
            && session.active_request_id.is_none()
            && session.work_state != WorkState::Working
        {
            tracing::debug!(session_id = %session.id, "duplicate completion ignored");
            return Ok(());
        }

        if let Some(request_id) = request_id {
            self.resolver.forget_request(request_id);
        }
        if let Some(active) = session.active_request_id.take() {
            self.resolver.forget_request(&active);
        }
        if session.work_state == WorkState::Working {
            session.work_state = WorkState::Idle;
        }
        session.touch();
        match self.store.update_session(&session).await {
            Ok(()) => self.publisher.session_updated(&session),
            Err(err) => tracing::warn!(
                session_id = %session.id,
                error = %err,
                "failed to mark session idle"
            ),
        }

        let in_flight = self.prompts.in_flight_session(host_id).await;
        if in_flight.is_none() || in_flight.as_deref() == Some(session.id.as_str()) {
            self.prompts.on_host_idle(host_id).await;
        }
        Ok(())
    }

    pub async fn create_session(&self, request: NewSession) -> Result<Session, SyncError> {
        if request.host_id.trim().is_empty() {
            return Err(SyncError::InvalidRequest {
                message: "host_id is required".to_string(),
            });
        }
        let name = request
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string());
        let mut session = Session::new(new_session_id(), name, Some(request.host_id));
        session.group_id = request.group_id;
        session.agent_thread_id = request.agent_thread_id;
        self.store.insert_session(&session).await?;
        if let Some(thread_id) = &session.agent_thread_id {
            self.resolver.remember_thread(thread_id, &session.id);
        }
        tracing::info!(
            session_id = %session.id,
            host_id = ?session.host_id,
            "session created"
        );
        self.publisher.session_updated(&session);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, SyncError> {
        require_session(self.store.as_ref(), session_id).await
    }

    pub async fn list_sessions(
        &self,
        desired_state: Option<DesiredState>,
    ) -> Result<Vec<Session>, SyncError> {
        match desired_state {
            Some(state) => self.store.list_sessions_by_desired_state(state).await,
            None => self.store.list_sessions().await,
        }
    }

    pub async fn get_interaction(
        &self,
        session_id: &str,
        interaction_id: &str,
    ) -> Result<Interaction, SyncError> {
        require_session(self.store.as_ref(), session_id).await?;
        self.store
            .get_interaction(interaction_id)
            .await?
            .filter(|interaction| interaction.session_id == session_id)
            .ok_or_else(|| SyncError::InteractionNotFound {
                interaction_id: interaction_id.to_string(),
            })
    }

    /// Queues a user prompt behind whatever the session's host is doing.
    pub async fn submit_prompt(
        &self,
        session_id: &str,
        content: String,
    ) -> Result<SubmitOutcome, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidRequest {
                message: "prompt content is empty".to_string(),
            });
        }
        let session = require_session(self.store.as_ref(), session_id).await?;
        if session.work_state == WorkState::Done {
            return Err(SyncError::Conflict {
                message: format!("session {session_id} is finished"),
            });
        }
        let host_id = session
            .host_id
            .clone()
            .ok_or_else(|| SyncError::InvalidRequest {
                message: format!("session {session_id} has no host"),
            })?;
        Ok(self
            .prompts
            .submit(&host_id, QueuedPrompt::new(session.id, content))
            .await?)
    }

    /// External "workflow finished" signal: `done` and `stopped`.
    pub async fn finish_session(&self, session_id: &str) -> Result<Session, SyncError> {
        let mut session = require_session(self.store.as_ref(), session_id).await?;
        session.work_state = WorkState::Done;
        session.desired_state = DesiredState::Stopped;
        session.touch();
        self.store.update_session(&session).await?;
        tracing::info!(session_id = %session_id, "session finished");
        self.publisher.session_updated(&session);
        Ok(session)
    }

    pub async fn set_desired_state(
        &self,
        session_id: &str,
        desired_state: DesiredState,
    ) -> Result<Session, SyncError> {
        let mut session = require_session(self.store.as_ref(), session_id).await?;
        if session.desired_state != desired_state {
            session.desired_state = desired_state;
            session.touch();
            self.store.update_session(&session).await?;
            tracing::info!(
                session_id = %session_id,
                desired_state = desired_state.as_str(),
                "desired state changed"
            );
            self.publisher.session_updated(&session);
        }
        Ok(session)
    }

    /// Sends a raw command. Prompts must go through the prompt queue.
    pub fn send_command(
        &self,
        host_id: &str,
        command: Command,
    ) -> Result<EnqueueOutcome, SyncError> {
        if matches!(command, Command::SubmitPrompt { .. }) {
            return Err(SyncError::InvalidRequest {
                message: "submit_prompt must go through a session".to_string(),
            });
        }
        let kind = command.kind();
        let outcome = self.registry.enqueue(host_id, command)?;
        tracing::debug!(host_id = %host_id, command = kind, "command enqueued");
        Ok(outcome)
    }

    pub fn hosts(&self) -> Vec<ConnectionInfo> {
        self.registry.list()
    }

    pub async fn host_prompts(&self, host_id: &str) -> HostQueueSnapshot {
        self.prompts.snapshot(host_id).await
    }

    /// Re-queues prompts that were still pending when the process stopped.
    /// They go out once their host reports ready.
    pub async fn restore_prompts(&self) -> Result<usize, SyncError> {
        self.prompts.restore().await
    }

    pub async fn retry_failed_prompts(&self, host_id: &str) -> usize {
        self.prompts.retry_failed(host_id).await
    }

    pub async fn run_reconcile_pass(&self) -> Result<ReconcileReport, SyncError> {
        self.reconciler.run_pass().await
    }

    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        self.reconciler
            .clone()
            .spawn(self.config.reconcile_interval)
    }

    /// Writes every dirty streaming context before the process exits.
    pub async fn shutdown(&self) {
        let flushed = self.accumulator.flush_dirty(Duration::ZERO).await;
        tracing::info!(flushed, "sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt_queue::PromptStatus;
    use crate::store::MemorySessionStore;

    fn engine() -> (Arc<MemorySessionStore>, Arc<SyncEngine>) {
        let store = Arc::new(MemorySessionStore::new());
        let engine = SyncEngine::new(SyncConfig::default(), store.clone(), None);
        (store, engine)
    }

    #[tokio::test]
    async fn prompt_for_unconnected_host_is_rejected() {
        let (_store, engine) = engine();
        let session = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");

        let err = engine
            .submit_prompt(&session.id, "hello".to_string())
            .await
            .expect_err("no host");
        assert!(matches!(err, SyncError::HostNotConnected { .. }));

        let session = engine.get_session(&session.id).await.expect("session");
        assert_eq!(session.work_state, WorkState::Idle);
        assert_eq!(session.name, DEFAULT_THREAD_TITLE);
    }

    #[tokio::test]
    async fn held_prompt_creates_interaction_before_ready() {
        let (store, engine) = engine();
        let host = engine.connect_host("host-a");
        let session = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                name: Some("demo".to_string()),
                ..NewSession::default()
            })
            .await
            .expect("create");

        let outcome = engine
            .submit_prompt(&session.id, "hello".to_string())
            .await
            .expect("submit");
        assert!(matches!(outcome, SubmitOutcome::Dispatched(_)));
        assert_eq!(host.connection.pending_len(), 1);

        let session = engine.get_session(&session.id).await.expect("session");
        assert_eq!(session.work_state, WorkState::Working);
        let interaction_id = session.current_interaction_id.expect("interaction");
        let interaction = store
            .get_interaction(&interaction_id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(interaction.prompt, "hello");
        assert!(!interaction.completed);
    }

    #[tokio::test]
    async fn finished_session_rejects_prompts() {
        let (_store, engine) = engine();
        let session = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        let finished = engine.finish_session(&session.id).await.expect("finish");
        assert_eq!(finished.work_state, WorkState::Done);
        assert_eq!(finished.desired_state, DesiredState::Stopped);

        let err = engine
            .submit_prompt(&session.id, "more".to_string())
            .await
            .expect_err("finished");
        assert!(matches!(err, SyncError::Conflict { .. }));
    }

    #[tokio::test]
    async fn raw_prompts_are_refused() {
        let (_store, engine) = engine();
        let _host = engine.connect_host("host-a");
        let err = engine
            .send_command(
                "host-a",
                Command::SubmitPrompt {
                    thread_id: None,
                    content: "x".to_string(),
                    request_id: "req_1".to_string(),
                    resume: false,
                    agent_name: None,
                },
            )
            .expect_err("refused");
        assert!(matches!(err, SyncError::InvalidRequest { .. }));
        assert_eq!(
            engine
                .send_command("host-a", Command::QueryState)
                .expect("query"),
            EnqueueOutcome::Queued
        );
    }

    #[tokio::test]
    async fn interaction_lookup_checks_owner() {
        let (store, engine) = engine();
        let first = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        let second = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        let interaction = Interaction::new("int_1", first.id.clone(), "hi", None);
        store
            .insert_interaction(&interaction)
            .await
            .expect("insert");

        assert!(engine.get_interaction(&first.id, "int_1").await.is_ok());
        let err = engine
            .get_interaction(&second.id, "int_1")
            .await
            .expect_err("wrong session");
        assert!(matches!(err, SyncError::InteractionNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unready_host_is_dropped_after_timeout() {
        let (store, engine) = engine();
        let host = engine.connect_host("host-a");
        let session = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        engine
            .submit_prompt(&session.id, "never delivered".to_string())
            .await
            .expect("held");
        assert_eq!(host.connection.pending_len(), 1);

        tokio::time::sleep(engine.config().ready_timeout + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(engine.hosts().is_empty());
        assert!(host.connection.is_closed());
        assert_eq!(host.connection.pending_len(), 0);

        let snapshot = engine.host_prompts("host-a").await;
        assert!(snapshot.in_flight.is_none());
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(snapshot.failed[0].content, "never delivered");
        let failed = store
            .list_prompts_by_status(PromptStatus::Failed)
            .await
            .expect("prompts");
        assert_eq!(failed.len(), 1);

        let session = engine.get_session(&session.id).await.expect("session");
        assert_eq!(session.work_state, WorkState::Idle);
        assert_eq!(session.active_request_id, None);
        let interaction = store
            .get_interaction(session.current_interaction_id.as_deref().expect("id"))
            .await
            .expect("read")
            .expect("interaction");
        assert!(interaction.completed);
        assert_eq!(interaction.error.as_deref(), Some(UNDELIVERED_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_host_outlives_timeout() {
        let (_store, engine) = engine();
        let host = engine.connect_host("host-a");
        engine
            .handle_event(
                "host-a",
                SyncEvent::HostReady {
                    host_id: None,
                    resumed_thread_id: None,
                },
            )
            .await
            .expect("ready");

        tokio::time::sleep(engine.config().ready_timeout * 2).await;
        assert_eq!(engine.hosts().len(), 1);
        assert!(!host.connection.is_closed());
    }

    #[tokio::test]
    async fn closing_hosts_keeps_queued_prompts_pending() {
        let (store, engine) = engine();
        let host_a = engine.connect_host("host-a");
        let host_b = engine.connect_host("host-b");
        let first = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        engine
            .submit_prompt(&first.id, "one".to_string())
            .await
            .expect("one");
        engine
            .submit_prompt(&first.id, "two".to_string())
            .await
            .expect("two");

        assert_eq!(engine.close_hosts(), 2);
        assert!(engine.hosts().is_empty());
        assert!(host_a.connection.is_closed());
        assert!(host_b.connection.is_closed());

        engine.disconnect_host(&host_a.connection).await;
        let pending = store
            .list_prompts_by_status(PromptStatus::Pending)
            .await
            .expect("prompts");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "two");
    }

    #[tokio::test]
    async fn restored_prompt_for_finished_session_is_rejected() {
        let (store, engine) = engine();
        let session = engine
            .create_session(NewSession {
                host_id: "host-a".to_string(),
                ..NewSession::default()
            })
            .await
            .expect("create");
        let mut prompt = QueuedPrompt::new(session.id.clone(), "too late");
        prompt.host_id = "host-a".to_string();
        store.save_prompt(&prompt).await.expect("seed");
        engine.finish_session(&session.id).await.expect("finish");

        assert_eq!(engine.restore_prompts().await.expect("restore"), 1);
        let mut host = engine.connect_host("host-a");
        engine
            .handle_event(
                "host-a",
                SyncEvent::HostReady {
                    host_id: None,
                    resumed_thread_id: None,
                },
            )
            .await
            .expect("ready");

        assert!(host.outbound.try_recv().is_err());
        let snapshot = engine.host_prompts("host-a").await;
        assert!(snapshot.in_flight.is_none());
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(snapshot.failed[0].id, prompt.id);
    }
}
