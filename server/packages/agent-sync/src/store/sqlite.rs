use std::path::{Path, PathBuf};
use std::str::FromStr;

use agent_sync_error::SyncError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{SessionStore, StoreFuture};
use crate::model::{DesiredState, Interaction, Session, WorkState};
use crate::prompt_queue::{PromptStatus, QueuedPrompt};

const SESSION_COLUMNS: &str = "id, name, host_id, group_id, agent_thread_id, desired_state, work_state, current_interaction_id, active_request_id, created_at, updated_at";

const INTERACTION_COLUMNS: &str = "id, session_id, request_id, prompt, response, segment_key, segment_offset, completed, error, created_at, updated_at, completed_at";

const PROMPT_COLUMNS: &str = "id, host_id, session_id, content, resume, from_queue, status, error, created_at, updated_at";

const MIGRATIONS: [&str; 2] = [
    include_str!("../../migrations/0001_init.sql"),
    include_str!("../../migrations/0002_prompts.sql"),
];

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteSessionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| SyncError::store(err.to_string()))?;
            }
        }

        let connect = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(store_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await
            .map_err(store_err)?;

        sqlx::query("PRAGMA synchronous=NORMAL;")
            .execute(&pool)
            .await
            .map_err(store_err)?;
        for migration in MIGRATIONS {
            sqlx::query(migration)
                .execute(&pool)
                .await
                .map_err(store_err)?;
        }

        tracing::info!(path = %path.display(), "sqlite session store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), SyncError> {
        sqlx::query(
            r#"INSERT INTO sessions (
                id, name, host_id, group_id, agent_thread_id, desired_state, work_state,
                current_interaction_id, active_request_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host_id = excluded.host_id,
                group_id = excluded.group_id,
                agent_thread_id = excluded.agent_thread_id,
                desired_state = excluded.desired_state,
                work_state = excluded.work_state,
                current_interaction_id = excluded.current_interaction_id,
                active_request_id = excluded.active_request_id,
                updated_at = excluded.updated_at"#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.host_id)
        .bind(&session.group_id)
        .bind(&session.agent_thread_id)
        .bind(session.desired_state.as_str())
        .bind(session.work_state.as_str())
        .bind(&session.current_interaction_id)
        .bind(&session.active_request_id)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn upsert_interaction(&self, interaction: &Interaction) -> Result<(), SyncError> {
        sqlx::query(
            r#"INSERT INTO interactions (
                id, session_id, request_id, prompt, response, segment_key, segment_offset,
                completed, error, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                request_id = excluded.request_id,
                response = excluded.response,
                segment_key = excluded.segment_key,
                segment_offset = excluded.segment_offset,
                completed = excluded.completed,
                error = excluded.error,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at"#,
        )
        .bind(&interaction.id)
        .bind(&interaction.session_id)
        .bind(&interaction.request_id)
        .bind(&interaction.prompt)
        .bind(&interaction.response)
        .bind(&interaction.segment_key)
        .bind(interaction.segment_offset as i64)
        .bind(interaction.completed)
        .bind(&interaction.error)
        .bind(interaction.created_at.timestamp_millis())
        .bind(interaction.updated_at.timestamp_millis())
        .bind(interaction.completed_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn upsert_prompt(&self, prompt: &QueuedPrompt) -> Result<(), SyncError> {
        sqlx::query(
            r#"INSERT INTO prompts (
                id, host_id, session_id, content, resume, from_queue, status, error,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                host_id = excluded.host_id,
                from_queue = excluded.from_queue,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at"#,
        )
        .bind(&prompt.id)
        .bind(&prompt.host_id)
        .bind(&prompt.session_id)
        .bind(&prompt.content)
        .bind(prompt.resume)
        .bind(prompt.from_queue)
        .bind(prompt.status.as_str())
        .bind(&prompt.error)
        .bind(prompt.created_at.timestamp_millis())
        .bind(prompt.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fetch_sessions(
        &self,
        filter: &str,
        value: Option<&str>,
    ) -> Result<Vec<Session>, SyncError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {filter} ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(store_err)?;
        rows.iter().map(session_from_row).collect()
    }
}

impl SessionStore for SqliteSessionStore {
    fn get_session<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            row.as_ref().map(session_from_row).transpose()
        })
    }

    fn list_sessions_by_desired_state(
        &self,
        state: DesiredState,
    ) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move {
            self.fetch_sessions("WHERE desired_state = ?1", Some(state.as_str()))
                .await
        })
    }

    fn list_sessions(&self) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move { self.fetch_sessions("", None).await })
    }

    fn list_sessions_by_group<'a>(&'a self, group_id: &'a str) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            self.fetch_sessions("WHERE group_id = ?1", Some(group_id))
                .await
        })
    }

    fn insert_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
                .bind(&session.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            if exists.is_some() {
                return Err(SyncError::Conflict {
                    message: format!("session {} already exists", session.id),
                });
            }
            self.upsert_session(session).await
        })
    }

    fn update_session<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.upsert_session(session).await })
    }

    fn find_session_by_agent_thread_id<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE agent_thread_id = ?1 ORDER BY updated_at DESC LIMIT 1"
            );
            let row = sqlx::query(&sql)
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            row.as_ref().map(session_from_row).transpose()
        })
    }

    fn get_interaction<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Interaction>> {
        Box::pin(async move {
            let sql = format!("SELECT {INTERACTION_COLUMNS} FROM interactions WHERE id = ?1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
            row.as_ref().map(interaction_from_row).transpose()
        })
    }

    fn insert_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.upsert_interaction(interaction).await })
    }

    fn update_interaction<'a>(&'a self, interaction: &'a Interaction) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.upsert_interaction(interaction).await })
    }

    fn save_prompt<'a>(&'a self, prompt: &'a QueuedPrompt) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.upsert_prompt(prompt).await })
    }

    fn list_prompts_by_status(&self, status: PromptStatus) -> StoreFuture<'_, Vec<QueuedPrompt>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PROMPT_COLUMNS} FROM prompts WHERE status = ?1 ORDER BY created_at ASC, id ASC"
            );
            let rows = sqlx::query(&sql)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
            rows.iter().map(prompt_from_row).collect()
        })
    }
}

fn store_err(err: sqlx::Error) -> SyncError {
    SyncError::store(err.to_string())
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, SyncError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SyncError::store(format!("invalid timestamp {ms}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, SyncError> {
    let desired: String = row.try_get("desired_state").map_err(store_err)?;
    let work: String = row.try_get("work_state").map_err(store_err)?;
    Ok(Session {
        id: row.try_get("id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        host_id: row.try_get("host_id").map_err(store_err)?,
        group_id: row.try_get("group_id").map_err(store_err)?,
        agent_thread_id: row.try_get("agent_thread_id").map_err(store_err)?,
        desired_state: DesiredState::parse(&desired)
            .ok_or_else(|| SyncError::store(format!("unknown desired state {desired}")))?,
        work_state: WorkState::parse(&work)
            .ok_or_else(|| SyncError::store(format!("unknown work state {work}")))?,
        current_interaction_id: row.try_get("current_interaction_id").map_err(store_err)?,
        active_request_id: row.try_get("active_request_id").map_err(store_err)?,
        created_at: timestamp(row.try_get("created_at").map_err(store_err)?)?,
        updated_at: timestamp(row.try_get("updated_at").map_err(store_err)?)?,
    })
}

fn interaction_from_row(row: &SqliteRow) -> Result<Interaction, SyncError> {
    let segment_offset: i64 = row.try_get("segment_offset").map_err(store_err)?;
    let completed_at: Option<i64> = row.try_get("completed_at").map_err(store_err)?;
    Ok(Interaction {
        id: row.try_get("id").map_err(store_err)?,
        session_id: row.try_get("session_id").map_err(store_err)?,
        request_id: row.try_get("request_id").map_err(store_err)?,
        prompt: row.try_get("prompt").map_err(store_err)?,
        response: row.try_get("response").map_err(store_err)?,
        segment_key: row.try_get("segment_key").map_err(store_err)?,
        segment_offset: usize::try_from(segment_offset).unwrap_or(0),
        completed: row.try_get("completed").map_err(store_err)?,
        error: row.try_get("error").map_err(store_err)?,
        created_at: timestamp(row.try_get("created_at").map_err(store_err)?)?,
        updated_at: timestamp(row.try_get("updated_at").map_err(store_err)?)?,
        completed_at: completed_at.map(timestamp).transpose()?,
    })
}

fn prompt_from_row(row: &SqliteRow) -> Result<QueuedPrompt, SyncError> {
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(QueuedPrompt {
        id: row.try_get("id").map_err(store_err)?,
        host_id: row.try_get("host_id").map_err(store_err)?,
        session_id: row.try_get("session_id").map_err(store_err)?,
        content: row.try_get("content").map_err(store_err)?,
        resume: row.try_get("resume").map_err(store_err)?,
        from_queue: row.try_get("from_queue").map_err(store_err)?,
        status: PromptStatus::parse(&status)
            .ok_or_else(|| SyncError::store(format!("unknown prompt status {status}")))?,
        error: row.try_get("error").map_err(store_err)?,
        created_at: timestamp(row.try_get("created_at").map_err(store_err)?)?,
        updated_at: timestamp(row.try_get("updated_at").map_err(store_err)?)?,
    })
}
