use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method as HttpMethod};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::lifecycle::{BackendLaunch, LifecycleManager, ProcessLifecycleManager};
use crate::model::{DesiredState, Session};
use crate::protocol::{Command, SyncEvent};
use crate::publisher::SubscriberEvent;
use crate::router::{
    build_router, CreateSessionRequest, PromptRequest, PromptResponse, SessionListResponse,
};
use crate::store::{MemorySessionStore, SessionStore, SqliteSessionStore};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2480;
const MEMORY_DB: &str = ":memory:";

#[derive(Parser, Debug)]
#[command(name = "agent-sync", bin_name = "agent-sync")]
#[command(about = "Control-plane sync server for remote agent hosts", version)]
#[command(arg_required_else_help = true)]
pub struct AgentSyncCli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the sync server: host WebSocket endpoint plus the control API.
    Server(ServerArgs),
    /// Print JSON Schemas for the host wire protocol.
    Schema(SchemaArgs),
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path, or `:memory:` for a non-durable store.
    #[arg(long)]
    db: Option<String>,

    #[arg(long = "reconcile-interval-secs", default_value_t = 30)]
    reconcile_interval_secs: u64,

    #[arg(long = "ready-timeout-secs", default_value_t = 60)]
    ready_timeout_secs: u64,

    /// Program started once per running session that has no backend.
    #[arg(long = "backend-command")]
    backend_command: Option<String>,

    #[arg(long = "backend-arg", requires = "backend_command", allow_hyphen_values = true)]
    backend_arg: Vec<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(long, value_enum, default_value_t = SchemaKind::All)]
    kind: SchemaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaKind {
    All,
    Events,
    Commands,
    Subscriber,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Manage sessions.
    Sessions(SessionsArgs),
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    command: SessionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    #[command(name = "list")]
    /// List sessions.
    List(SessionListArgs),
    #[command(name = "create")]
    /// Create a session bound to a host.
    Create(SessionCreateArgs),
    #[command(name = "prompt")]
    /// Submit a prompt to a session.
    Prompt(SessionPromptArgs),
    #[command(name = "finish")]
    /// Mark a session finished.
    Finish(SessionFinishArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionListArgs {
    /// Only sessions with this desired state (`running` or `stopped`).
    #[arg(long)]
    desired_state: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct SessionCreateArgs {
    #[arg(long)]
    host_id: String,
    #[arg(long, short = 'n')]
    name: Option<String>,
    #[arg(long, short = 'g')]
    group_id: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct SessionPromptArgs {
    session_id: String,
    #[arg(long, short = 'm')]
    content: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct SessionFinishArgs {
    session_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid desired state: {0}")]
    InvalidDesiredState(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_agent_sync() -> Result<(), CliError> {
    let cli = AgentSyncCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &CliCommand) -> Result<(), CliError> {
    match command {
        CliCommand::Server(args) => run_server(args),
        CliCommand::Schema(args) => print_schema(args.kind),
        CliCommand::Api(subcommand) => run_api(&subcommand.command),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let reconcile_interval = Duration::from_secs(server.reconcile_interval_secs.max(1));
    let config = SyncConfig {
        reconcile_interval,
        restart_grace: reconcile_interval,
        ready_timeout: Duration::from_secs(server.ready_timeout_secs.max(1)),
        ..SyncConfig::default()
    };
    let cors = build_cors_layer(server)?;
    let db = server
        .db
        .clone()
        .unwrap_or_else(|| default_db_path().to_string_lossy().into_owned());
    let lifecycle = server.backend_command.as_ref().map(|program| {
        let mut launch = BackendLaunch::new(program.clone());
        launch.args = server.backend_arg.clone();
        Arc::new(ProcessLifecycleManager::new(launch))
    });
    let addr = format!("{}:{}", server.host, server.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let (store, sqlite) = open_store(&db).await?;
        let engine = SyncEngine::new(
            config,
            store,
            lifecycle
                .clone()
                .map(|manager| manager as Arc<dyn LifecycleManager>),
        );
        if lifecycle.is_none() {
            tracing::info!("no backend command configured; reconciler only flushes");
        }
        engine
            .restore_prompts()
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        let reconciler = engine.spawn_reconciler();
        let router = build_router(engine.clone()).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, db = %db, "server listening");
        let closing = engine.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                closing.close_hosts();
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));

        reconciler.abort();
        engine.shutdown().await;
        if let Some(manager) = lifecycle {
            manager.shutdown().await;
        }
        if let Some(sqlite) = sqlite {
            sqlite.close().await;
        }
        served
    })
}

async fn open_store(
    db: &str,
) -> Result<(Arc<dyn SessionStore>, Option<Arc<SqliteSessionStore>>), CliError> {
    if db == MEMORY_DB {
        tracing::warn!("using in-memory store; sessions will not survive a restart");
        return Ok((Arc::new(MemorySessionStore::new()), None));
    }
    let sqlite = Arc::new(
        SqliteSessionStore::open(db)
            .await
            .map_err(|err| CliError::Server(err.to_string()))?,
    );
    Ok((sqlite.clone(), Some(sqlite)))
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("AGENT_SYNC_DB") {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("agent-sync").join("agent-sync.db"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-sync").join("agent-sync.db"))
}

fn print_schema(kind: SchemaKind) -> Result<(), CliError> {
    let value = match kind {
        SchemaKind::Events => serde_json::to_value(schemars::schema_for!(SyncEvent))?,
        SchemaKind::Commands => serde_json::to_value(schemars::schema_for!(Command))?,
        SchemaKind::Subscriber => serde_json::to_value(schemars::schema_for!(SubscriberEvent))?,
        SchemaKind::All => json!({
            "syncEvent": schemars::schema_for!(SyncEvent),
            "command": schemars::schema_for!(Command),
            "subscriberEvent": schemars::schema_for!(SubscriberEvent),
        }),
    };
    write_stdout_line(&serde_json::to_string_pretty(&value)?)
}

fn run_api(command: &ApiCommand) -> Result<(), CliError> {
    match command {
        ApiCommand::Sessions(subcommand) => run_sessions(&subcommand.command),
    }
}

fn run_sessions(command: &SessionsCommand) -> Result<(), CliError> {
    match command {
        SessionsCommand::List(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let desired_state = match args.desired_state.as_deref() {
                Some(value) => Some(
                    DesiredState::parse(value)
                        .ok_or_else(|| CliError::InvalidDesiredState(value.to_string()))?
                        .as_str()
                        .to_string(),
                ),
                None => None,
            };
            let response = ctx.get_with_query(
                &format!("{API_PREFIX}/sessions"),
                &[("desired_state", desired_state)],
            )?;
            print_json_response::<SessionListResponse>(response)
        }
        SessionsCommand::Create(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let body = CreateSessionRequest {
                host_id: args.host_id.clone(),
                name: args.name.clone(),
                group_id: args.group_id.clone(),
                agent_thread_id: None,
            };
            let response = ctx.post(&format!("{API_PREFIX}/sessions"), &body)?;
            print_json_response::<Session>(response)
        }
        SessionsCommand::Prompt(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let body = PromptRequest {
                content: args.content.clone(),
            };
            let path = format!("{API_PREFIX}/sessions/{}/prompts", args.session_id);
            let response = ctx.post(&path, &body)?;
            print_json_response::<PromptResponse>(response)
        }
        SessionsCommand::Finish(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let path = format!("{API_PREFIX}/sessions/{}/finish", args.session_id);
            let response = ctx.post_empty(&path)?;
            print_json_response::<Session>(response)
        }
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let origins: Vec<HeaderValue> =
        parse_each(&server.cors_allow_origin, CliError::InvalidCorsOrigin)?;
    let methods: Vec<HttpMethod> =
        parse_each(&server.cors_allow_method, CliError::InvalidCorsMethod)?;
    let headers: Vec<HeaderName> =
        parse_each(&server.cors_allow_header, CliError::InvalidCorsHeader)?;

    // An empty origin list disables cross-origin access entirely.
    let mut cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    cors = if methods.is_empty() {
        cors.allow_methods(Any)
    } else {
        cors.allow_methods(methods)
    };
    cors = if headers.is_empty() {
        cors.allow_headers(Any)
    } else {
        cors.allow_headers(headers)
    };
    Ok(cors.allow_credentials(server.cors_allow_credentials))
}

fn parse_each<T: FromStr>(
    values: &[String],
    invalid: fn(String) -> CliError,
) -> Result<Vec<T>, CliError> {
    values
        .iter()
        .map(|value| value.parse().map_err(|_| invalid(value.clone())))
        .collect()
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        let mut request = self.request(Method::GET, path);
        for (key, value) in query {
            if let Some(value) = value {
                request = request.query(&[(key, value)]);
            }
        }
        Ok(request.send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }

    fn post_empty(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
