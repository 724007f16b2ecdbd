//! Absorbs streamed response content, throttles durable writes and
//! subscriber publication, and encodes outbound updates as patches.
//!
//! A [`StreamingContext`] lives only while an interaction streams. Losing it
//! costs one store read on the next chunk; the durable records stay the
//! source of truth whenever no context exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agent_sync_error::SyncError;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::model::{new_interaction_id, Interaction, Session, WorkState};
use crate::patch::compute_patch;
use crate::publisher::Publisher;
use crate::store::{require_session, SessionStore};

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub write_interval: Duration,
    pub publish_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_millis(200),
            publish_interval: Duration::from_millis(50),
        }
    }
}

/// One full-content update from the host.
#[derive(Debug, Clone, Copy)]
pub struct ChunkUpdate<'a> {
    pub content: &'a str,
    /// Agent message identity; a new key starts a new segment.
    pub segment_key: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

impl<'a> ChunkUpdate<'a> {
    pub fn new(content: &'a str) -> Self {
        Self {
            content,
            segment_key: None,
            request_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct WriteState {
    dirty: bool,
    last_write: Option<Instant>,
}

#[derive(Debug)]
pub struct StreamingContext {
    session: Session,
    interaction: Interaction,
    published: String,
    last_publish: Option<Instant>,
}

impl StreamingContext {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }
}

#[derive(Debug)]
struct ContextSlot {
    context: Mutex<StreamingContext>,
    write_state: StdMutex<WriteState>,
}

impl ContextSlot {
    fn new(context: StreamingContext) -> Self {
        Self {
            context: Mutex::new(context),
            write_state: StdMutex::new(WriteState::default()),
        }
    }

    fn write_due(&self, now: Instant, interval: Duration) -> bool {
        self.write_state
            .lock()
            .map(|state| match state.last_write {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= interval,
            })
            .unwrap_or(true)
    }

    fn stale_and_dirty(&self, now: Instant, interval: Duration) -> bool {
        self.write_state
            .lock()
            .map(|state| {
                state.dirty
                    && state
                        .last_write
                        .map(|last| now.saturating_duration_since(last) >= interval)
                        .unwrap_or(true)
            })
            .unwrap_or(false)
    }

    fn record_write(&self, now: Instant, ok: bool) {
        if let Ok(mut state) = self.write_state.lock() {
            state.last_write = Some(now);
            state.dirty = !ok;
        }
    }

    fn mark_dirty(&self) {
        if let Ok(mut state) = self.write_state.lock() {
            state.dirty = true;
        }
    }

    fn is_dirty(&self) -> bool {
        self.write_state.lock().map(|state| state.dirty).unwrap_or(false)
    }
}

pub struct StreamingAccumulator {
    store: Arc<dyn SessionStore>,
    publisher: Arc<Publisher>,
    throttle: ThrottleConfig,
    contexts: StdMutex<HashMap<String, Arc<ContextSlot>>>,
}

impl StreamingAccumulator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        publisher: Arc<Publisher>,
        throttle: ThrottleConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            throttle,
            contexts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.slot(session_id).is_some()
    }

    /// Whether the session has content not yet written durably.
    pub fn is_dirty(&self, session_id: &str) -> bool {
        self.slot(session_id)
            .map(|slot| slot.is_dirty())
            .unwrap_or(false)
    }

    pub async fn on_chunk(
        &self,
        session_id: &str,
        update: ChunkUpdate<'_>,
    ) -> Result<(), SyncError> {
        let slot = match self.slot(session_id) {
            Some(slot) => slot,
            None => self.open_context(session_id, update.request_id).await?,
        };

        let mut context = slot.context.lock().await;
        let segment_key = update.segment_key.or(update.request_id);
        if !context.interaction.apply_content(segment_key, update.content) {
            return Ok(());
        }

        let now = Instant::now();
        if slot.write_due(now, self.throttle.write_interval) {
            let result = self.store.update_interaction(&context.interaction).await;
            if let Err(err) = &result {
                tracing::warn!(
                    session_id = %session_id,
                    interaction_id = %context.interaction.id,
                    error = %err,
                    "streaming write failed; will retry on next tick"
                );
            }
            slot.record_write(now, result.is_ok());
        } else {
            slot.mark_dirty();
        }

        let publish_due = context
            .last_publish
            .map(|last| now.saturating_duration_since(last) >= self.throttle.publish_interval)
            .unwrap_or(true);
        if publish_due {
            self.publish_patch(&mut context, now);
        }
        Ok(())
    }

    /// Final flush: always writes and publishes, then drops the context.
    ///
    /// Returns the completed interaction, or `None` when the session has no
    /// open interaction. A failed write keeps the context around, marked
    /// dirty, so [`StreamingAccumulator::flush_stale`] retries it.
    pub async fn on_complete(
        &self,
        session_id: &str,
        final_content: Option<ChunkUpdate<'_>>,
    ) -> Result<Option<Interaction>, SyncError> {
        self.finish(session_id, final_content, None).await
    }

    /// Completes the open interaction with an error note.
    pub async fn on_failed(
        &self,
        session_id: &str,
        error: String,
    ) -> Result<Option<Interaction>, SyncError> {
        self.finish(session_id, None, Some(error)).await
    }

    /// Writes a completed context that is still held because its final write
    /// failed, then drops it. Returns whether such a context existed.
    pub async fn flush_completed(&self, session_id: &str) -> Result<bool, SyncError> {
        let Some(slot) = self.slot(session_id) else {
            return Ok(false);
        };
        let context = slot.context.lock().await;
        if !context.interaction.completed {
            return Ok(false);
        }
        let result = self.store.update_interaction(&context.interaction).await;
        slot.record_write(Instant::now(), result.is_ok());
        result?;
        drop(context);
        self.remove_slot(session_id, &slot);
        Ok(true)
    }

    /// Writes contexts whose dirty content is older than the write interval.
    /// Busy contexts are skipped. Returns how many were written.
    pub async fn flush_stale(&self) -> usize {
        self.flush_dirty(self.throttle.write_interval).await
    }

    /// Writes every dirty context whose last write is at least `min_age` old.
    pub async fn flush_dirty(&self, min_age: Duration) -> usize {
        let now = Instant::now();
        let candidates: Vec<(String, Arc<ContextSlot>)> = self
            .contexts
            .lock()
            .map(|contexts| {
                contexts
                    .iter()
                    .filter(|(_, slot)| slot.stale_and_dirty(now, min_age))
                    .map(|(id, slot)| (id.clone(), slot.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut flushed = 0;
        for (session_id, slot) in candidates {
            let Ok(context) = slot.context.try_lock() else {
                continue;
            };
            match self.store.update_interaction(&context.interaction).await {
                Ok(()) => {
                    slot.record_write(now, true);
                    flushed += 1;
                    if context.interaction.completed {
                        self.remove_slot(&session_id, &slot);
                    }
                }
                Err(err) => {
                    slot.record_write(now, false);
                    tracing::warn!(
                        session_id = %session_id,
                        interaction_id = %context.interaction.id,
                        error = %err,
                        "stale flush failed"
                    );
                }
            }
        }
        flushed
    }

    async fn finish(
        &self,
        session_id: &str,
        final_content: Option<ChunkUpdate<'_>>,
        error: Option<String>,
    ) -> Result<Option<Interaction>, SyncError> {
        let slot = match self.take_slot(session_id) {
            Some(slot) => slot,
            None => match self.load_open_context(session_id).await? {
                Some(context) => Arc::new(ContextSlot::new(context)),
                None => return Ok(None),
            },
        };

        let mut guard = slot.context.lock().await;
        let context = &mut *guard;
        if let Some(update) = final_content {
            context
                .interaction
                .apply_content(update.segment_key.or(update.request_id), update.content);
        }
        context.interaction.complete(error);

        let now = Instant::now();
        match self.store.update_interaction(&context.interaction).await {
            Ok(()) => slot.record_write(now, true),
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    interaction_id = %context.interaction.id,
                    error = %err,
                    "completion write failed; keeping context for retry"
                );
                slot.record_write(now, false);
                if let Ok(mut contexts) = self.contexts.lock() {
                    contexts
                        .entry(session_id.to_string())
                        .or_insert_with(|| slot.clone());
                }
            }
        }

        context.published.clone_from(&context.interaction.response);
        context.last_publish = Some(now);
        self.publisher.interaction_completed(&context.interaction);
        Ok(Some(context.interaction.clone()))
    }

    fn publish_patch(&self, context: &mut StreamingContext, now: Instant) {
        let patch = compute_patch(&context.published, &context.interaction.response);
        if patch.is_noop(context.published.len()) {
            return;
        }
        self.publisher.interaction_patch(&context.interaction, patch);
        context.published.clone_from(&context.interaction.response);
        context.last_publish = Some(now);
    }

    async fn open_context(
        &self,
        session_id: &str,
        request_id: Option<&str>,
    ) -> Result<Arc<ContextSlot>, SyncError> {
        let context = match self.load_open_context(session_id).await? {
            Some(context) => context,
            None => self.start_unprompted(session_id, request_id).await?,
        };
        let slot = Arc::new(ContextSlot::new(context));
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| SyncError::store("streaming context lock poisoned"))?;
        Ok(contexts
            .entry(session_id.to_string())
            .or_insert(slot)
            .clone())
    }

    async fn load_open_context(
        &self,
        session_id: &str,
    ) -> Result<Option<StreamingContext>, SyncError> {
        let session = require_session(self.store.as_ref(), session_id).await?;
        let Some(interaction_id) = session.current_interaction_id.clone() else {
            return Ok(None);
        };
        let Some(interaction) = self.store.get_interaction(&interaction_id).await? else {
            tracing::warn!(
                session_id = %session_id,
                interaction_id = %interaction_id,
                "session points at a missing interaction"
            );
            return Ok(None);
        };
        if interaction.completed {
            return Ok(None);
        }
        Ok(Some(StreamingContext {
            published: interaction.response.clone(),
            session,
            interaction,
            last_publish: None,
        }))
    }

    /// Output arriving for a session that was never prompted from here
    /// (e.g. the user typed into the agent directly) opens an interaction.
    /// A finished session stays `done`.
    async fn start_unprompted(
        &self,
        session_id: &str,
        request_id: Option<&str>,
    ) -> Result<StreamingContext, SyncError> {
        let mut session = require_session(self.store.as_ref(), session_id).await?;
        let interaction = Interaction::new(
            new_interaction_id(),
            session_id,
            String::new(),
            request_id.map(str::to_string),
        );
        self.store.insert_interaction(&interaction).await?;
        session.current_interaction_id = Some(interaction.id.clone());
        if session.work_state == WorkState::Done {
            tracing::info!(
                session_id = %session_id,
                "late output for a finished session; recording without reopening"
            );
        } else {
            session.work_state = WorkState::Working;
        }
        session.touch();
        self.store.update_session(&session).await?;
        self.publisher.interaction_created(&interaction);
        self.publisher.session_updated(&session);
        tracing::debug!(
            session_id = %session_id,
            interaction_id = %interaction.id,
            "opened interaction for unprompted output"
        );
        Ok(StreamingContext {
            session,
            interaction,
            published: String::new(),
            last_publish: None,
        })
    }

    fn slot(&self, session_id: &str) -> Option<Arc<ContextSlot>> {
        self.contexts
            .lock()
            .ok()
            .and_then(|contexts| contexts.get(session_id).cloned())
    }

    fn take_slot(&self, session_id: &str) -> Option<Arc<ContextSlot>> {
        self.contexts
            .lock()
            .ok()
            .and_then(|mut contexts| contexts.remove(session_id))
    }

    fn remove_slot(&self, session_id: &str, slot: &Arc<ContextSlot>) {
        if let Ok(mut contexts) = self.contexts.lock() {
            if contexts
                .get(session_id)
                .map(|current| Arc::ptr_eq(current, slot))
                .unwrap_or(false)
            {
                contexts.remove(session_id);
            }
        }
    }
}
