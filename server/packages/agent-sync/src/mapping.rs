//! Maps agent-side thread IDs and request correlation IDs to sessions.
//!
//! The in-memory maps are a cache rebuilt lazily from events. Every lookup
//! that misses falls back to the durable store before creating anything.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use agent_sync_error::SyncError;

use crate::model::{new_session_id, Session, DEFAULT_THREAD_TITLE, DEFAULT_USER_THREAD_TITLE};
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedBy {
    ThreadMap,
    RequestId,
    DurableStore,
    Group,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub session: Session,
    pub resolved_by: ResolvedBy,
}

impl Resolution {
    pub fn created(&self) -> bool {
        self.resolved_by == ResolvedBy::Created
    }

    /// Whether resolving changed the durable session record.
    pub fn session_changed(&self) -> bool {
        matches!(
            self.resolved_by,
            ResolvedBy::Created | ResolvedBy::RequestId | ResolvedBy::Group
        )
    }
}

/// The subset of an inbound event the resolver looks at.
#[derive(Debug, Clone, Default)]
pub struct ThreadRef<'a> {
    pub host_id: &'a str,
    pub thread_id: &'a str,
    pub request_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub title: Option<&'a str>,
    /// Name used when a session has to be created.
    pub default_title: &'a str,
}

impl<'a> ThreadRef<'a> {
    pub fn new(host_id: &'a str, thread_id: &'a str) -> Self {
        Self {
            host_id,
            thread_id,
            default_title: DEFAULT_THREAD_TITLE,
            ..Self::default()
        }
    }

    pub fn user_initiated(host_id: &'a str, thread_id: &'a str) -> Self {
        Self {
            default_title: DEFAULT_USER_THREAD_TITLE,
            ..Self::new(host_id, thread_id)
        }
    }

    pub fn with_request(mut self, request_id: Option<&'a str>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_group(mut self, group_id: Option<&'a str>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_title(mut self, title: Option<&'a str>) -> Self {
        self.title = title;
        self
    }
}

pub struct MappingResolver {
    store: Arc<dyn SessionStore>,
    threads: RwLock<HashMap<String, String>>,
    requests: RwLock<HashMap<String, String>>,
}

impl MappingResolver {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            threads: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Remembers which session a dispatched command targeted.
    pub fn record_request(&self, request_id: &str, session_id: &str) {
        if let Ok(mut requests) = self.requests.write() {
            requests.insert(request_id.to_string(), session_id.to_string());
        }
    }

    pub fn forget_request(&self, request_id: &str) -> Option<String> {
        self.requests
            .write()
            .ok()
            .and_then(|mut requests| requests.remove(request_id))
    }

    pub fn session_for_request(&self, request_id: &str) -> Option<String> {
        self.requests
            .read()
            .ok()
            .and_then(|requests| requests.get(request_id).cloned())
    }

    pub fn session_for_thread(&self, thread_id: &str) -> Option<String> {
        self.threads
            .read()
            .ok()
            .and_then(|threads| threads.get(thread_id).cloned())
    }

    /// Seeds the thread map, e.g. for sessions created with a known thread.
    pub fn remember_thread(&self, thread_id: &str, session_id: &str) {
        if let Ok(mut threads) = self.threads.write() {
            if let Some(previous) = threads.insert(thread_id.to_string(), session_id.to_string()) {
                if previous != session_id {
                    tracing::warn!(
                        thread_id = %thread_id,
                        previous_session = %previous,
                        session_id = %session_id,
                        "thread claimed by a different session; last claim wins"
                    );
                }
            }
        }
    }

    /// Drops every cached mapping. Durable records are untouched.
    pub fn clear(&self) {
        if let Ok(mut threads) = self.threads.write() {
            threads.clear();
        }
        if let Ok(mut requests) = self.requests.write() {
            requests.clear();
        }
    }

    /// Finds the session for an existing thread without creating one.
    pub async fn lookup(&self, thread_id: &str) -> Result<Option<Session>, SyncError> {
        if let Some(session_id) = self.session_for_thread(thread_id) {
            if let Some(session) = self.store.get_session(&session_id).await? {
                return Ok(Some(session));
            }
        }
        let found = self.store.find_session_by_agent_thread_id(thread_id).await?;
        if let Some(session) = &found {
            self.remember_thread(thread_id, &session.id);
        }
        Ok(found)
    }

    /// Resolves an event to a session, creating one if nothing matches.
    ///
    /// Order: cached thread map, the recorded request correlation ID, the
    /// durable thread lookup, an unmapped session in the same group, and
    /// finally a new session. Repeating the same event returns the same
    /// session.
    pub async fn resolve(&self, event: ThreadRef<'_>) -> Result<Resolution, SyncError> {
        if let Some(session_id) = self.session_for_thread(event.thread_id) {
            if let Some(session) = self.store.get_session(&session_id).await? {
                return Ok(Resolution {
                    session,
                    resolved_by: ResolvedBy::ThreadMap,
                });
            }
        }

        if let Some(request_id) = event.request_id {
            if let Some(session_id) = self.session_for_request(request_id) {
                if let Some(session) = self.store.get_session(&session_id).await? {
                    let session = self.bind_thread(session, &event).await?;
                    return Ok(Resolution {
                        session,
                        resolved_by: ResolvedBy::RequestId,
                    });
                }
            }
        }

        if let Some(session) = self
            .store
            .find_session_by_agent_thread_id(event.thread_id)
            .await?
        {
            self.remember_thread(event.thread_id, &session.id);
            tracing::debug!(
                thread_id = %event.thread_id,
                session_id = %session.id,
                "recovered thread mapping from store"
            );
            return Ok(Resolution {
                session,
                resolved_by: ResolvedBy::DurableStore,
            });
        }

        if let Some(group_id) = event.group_id {
            let candidates = self.store.list_sessions_by_group(group_id).await?;
            if let Some(session) = candidates
                .into_iter()
                .find(|session| session.agent_thread_id.is_none())
            {
                let session = self.bind_thread(session, &event).await?;
                return Ok(Resolution {
                    session,
                    resolved_by: ResolvedBy::Group,
                });
            }
        }

        let mut session = Session::new(
            new_session_id(),
            event.title.unwrap_or(event.default_title),
            Some(event.host_id.to_string()),
        );
        session.agent_thread_id = Some(event.thread_id.to_string());
        session.group_id = event.group_id.map(str::to_string);
        self.store.insert_session(&session).await?;
        self.remember_thread(event.thread_id, &session.id);
        tracing::info!(
            host_id = %event.host_id,
            thread_id = %event.thread_id,
            session_id = %session.id,
            "created session for new thread"
        );
        Ok(Resolution {
            session,
            resolved_by: ResolvedBy::Created,
        })
    }

    async fn bind_thread(
        &self,
        mut session: Session,
        event: &ThreadRef<'_>,
    ) -> Result<Session, SyncError> {
        if session.agent_thread_id.as_deref() != Some(event.thread_id) {
            if let Some(previous) = &session.agent_thread_id {
                tracing::info!(
                    session_id = %session.id,
                    previous_thread = %previous,
                    thread_id = %event.thread_id,
                    "session remapped to a new thread"
                );
            }
            session.agent_thread_id = Some(event.thread_id.to_string());
        }
        session.host_id = Some(event.host_id.to_string());
        if let Some(title) = event.title.filter(|title| !title.trim().is_empty()) {
            if is_placeholder_name(&session.name) && session.name != title {
                tracing::debug!(
                    session_id = %session.id,
                    title = %title,
                    "naming session from host title"
                );
                session.name = title.to_string();
            }
        }
        session.touch();
        self.store.update_session(&session).await?;
        self.remember_thread(event.thread_id, &session.id);
        Ok(session)
    }
}

/// Names nobody chose: empty or one of the defaults. A host title replaces
/// these; a name set through the API is kept.
fn is_placeholder_name(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == DEFAULT_THREAD_TITLE || name == DEFAULT_USER_THREAD_TITLE
}
