//! Durable session, interaction and prompt records.
//!
//! Calls are atomic per record; nothing in the sync engine needs
//! multi-record transactions.

use std::future::Future;
use std::pin::Pin;

use agent_sync_error::SyncError;

use crate::model::{DesiredState, Interaction, Session};
use crate::prompt_queue::{PromptStatus, QueuedPrompt};

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

pub trait SessionStore: Send + Sync + 'static {
    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>>;

    fn list_sessions_by_desired_state(&self, state: DesiredState)
        -> StoreFuture<'_, Vec<Session>>;

    fn list_sessions(&self) -> StoreFuture<'_, Vec<Session>>;

    fn list_sessions_by_group<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<Session>>;

    fn insert_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()>;

    fn update_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()>;

    fn find_session_by_agent_thread_id<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> StoreFuture<'a, Option<Session>>;

    fn get_interaction<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Interaction>>;

    fn insert_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()>;

    fn update_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()>;

    /// Inserts or replaces a prompt record.
    fn save_prompt<'a>(&'a self, prompt: &'a QueuedPrompt) -> StoreFuture<'a, ()>;

    /// Oldest first.
    fn list_prompts_by_status(&self, status: PromptStatus) -> StoreFuture<'_, Vec<QueuedPrompt>>;
}

/// Loads a session or reports it missing.
pub async fn require_session(
    store: &dyn SessionStore,
    session_id: &str,
) -> Result<Session, SyncError> {
    store
        .get_session(session_id)
        .await?
        .ok_or_else(|| SyncError::SessionNotFound {
            session_id: session_id.to_string(),
        })
}
