use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use agent_sync_error::SyncError;

use super::{SessionStore, StoreFuture};
use crate::model::{DesiredState, Interaction, Session};
use crate::prompt_queue::{PromptStatus, QueuedPrompt};

/// In-process store used for `--db :memory:` and tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    interactions: RwLock<HashMap<String, Interaction>>,
    prompts: RwLock<HashMap<String, QueuedPrompt>>,
    interaction_writes: AtomicU64,
    session_reads: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update_interaction` calls that reached the table.
    pub fn interaction_writes(&self) -> u64 {
        self.interaction_writes.load(Ordering::SeqCst)
    }

    pub fn session_reads(&self) -> u64 {
        self.session_reads.load(Ordering::SeqCst)
    }

    /// Makes every write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::store("write rejected"));
        }
        Ok(())
    }

    fn sessions_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Session>>, SyncError> {
        self.sessions
            .read()
            .map_err(|_| SyncError::store("session table lock poisoned"))
    }

    fn sessions_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Session>>, SyncError> {
        self.sessions
            .write()
            .map_err(|_| SyncError::store("session table lock poisoned"))
    }

    fn interactions_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Interaction>>, SyncError> {
        self.interactions
            .write()
            .map_err(|_| SyncError::store("interaction table lock poisoned"))
    }

    fn filtered(&self, filter: impl Fn(&Session) -> bool) -> Result<Vec<Session>, SyncError> {
        let mut sessions: Vec<Session> = self
            .sessions_read()?
            .values()
            .filter(|session| filter(session))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            self.session_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.sessions_read()?.get(id).cloned())
        })
    }

    fn list_sessions_by_desired_state(
        &self,
        state: DesiredState,
    ) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move { self.filtered(|session| session.desired_state == state) })
    }

    fn list_sessions(&self) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move { self.filtered(|_| true) })
    }

    fn list_sessions_by_group<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            self.filtered(|session| session.group_id.as_deref() == Some(group_id))
        })
    }

    fn insert_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            let mut sessions = self.sessions_write()?;
            if sessions.contains_key(&session.id) {
                return Err(SyncError::Conflict {
                    message: format!("session {} already exists", session.id),
                });
            }
            sessions.insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    fn update_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.sessions_write()?
                .insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    fn find_session_by_agent_thread_id<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            self.session_reads.fetch_add(1, Ordering::SeqCst);
            let sessions = self.sessions_read()?;
            Ok(sessions
                .values()
                .filter(|session| session.agent_thread_id.as_deref() == Some(thread_id))
                .max_by(|a, b| a.updated_at.cmp(&b.updated_at))
                .cloned())
        })
    }

    fn get_interaction<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Interaction>> {
        Box::pin(async move {
            let interactions = self
                .interactions
                .read()
                .map_err(|_| SyncError::store("interaction table lock poisoned"))?;
            Ok(interactions.get(id).cloned())
        })
    }

    fn insert_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.interactions_write()?
                .insert(interaction.id.clone(), interaction.clone());
            Ok(())
        })
    }

    fn update_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.interactions_write()?
                .insert(interaction.id.clone(), interaction.clone());
            self.interaction_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn save_prompt<'a>(&'a self, prompt: &'a QueuedPrompt) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            self.prompts
                .write()
                .map_err(|_| SyncError::store("prompt table lock poisoned"))?
                .insert(prompt.id.clone(), prompt.clone());
            Ok(())
        })
    }

    fn list_prompts_by_status(&self, status: PromptStatus) -> StoreFuture<'_, Vec<QueuedPrompt>> {
        Box::pin(async move {
            let mut prompts: Vec<QueuedPrompt> = self
                .prompts
                .read()
                .map_err(|_| SyncError::store("prompt table lock poisoned"))?
                .values()
                .filter(|prompt| prompt.status == status)
                .cloned()
                .collect();
            prompts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(prompts)
        })
    }
}
