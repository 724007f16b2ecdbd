use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_sync_error::{ProblemDetails, SyncError};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::engine::{NewSession, SyncEngine};
use crate::model::{DesiredState, Interaction, Session};
use crate::prompt_queue::{HostQueueSnapshot, SubmitOutcome};
use crate::protocol::Command;
use crate::publisher::SequencedEvent;
use crate::registry::{ConnectionInfo, EnqueueOutcome, Readiness};
use crate::ws;

mod types;

pub use self::types::*;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/hosts", get(list_hosts))
        .route("/hosts/:host_id/commands", post(post_command))
        .route("/hosts/:host_id/prompts", get(get_host_prompts))
        .route("/hosts/:host_id/prompts/retry", post(retry_host_prompts))
        .route("/hosts/:host_id/sync", get(ws::host_sync))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:session_id", get(get_session))
        .route(
            "/sessions/:session_id/interactions/:interaction_id",
            get(get_interaction),
        )
        .route("/sessions/:session_id/prompts", post(post_prompt))
        .route("/sessions/:session_id/finish", post(finish_session))
        .route("/sessions/:session_id/desired-state", post(set_desired_state))
        .route("/events/sse", get(get_events_sse))
        .with_state(engine);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Sync(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_hosts(State(engine): State<Arc<SyncEngine>>) -> Json<HostListResponse> {
    Json(HostListResponse {
        hosts: engine.hosts().into_iter().map(HostInfo::from).collect(),
    })
}

async fn post_command(
    State(engine): State<Arc<SyncEngine>>,
    Path(host_id): Path<String>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let outcome = engine.send_command(&host_id, command)?;
    let outcome = match outcome {
        EnqueueOutcome::Sent => "sent",
        EnqueueOutcome::Queued => "queued",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            outcome: outcome.to_string(),
        }),
    ))
}

async fn get_host_prompts(
    State(engine): State<Arc<SyncEngine>>,
    Path(host_id): Path<String>,
) -> Json<HostQueueSnapshot> {
    Json(engine.host_prompts(&host_id).await)
}

async fn retry_host_prompts(
    State(engine): State<Arc<SyncEngine>>,
    Path(host_id): Path<String>,
) -> Json<RetryPromptsResponse> {
    let retried = engine.retry_failed_prompts(&host_id).await;
    Json(RetryPromptsResponse {
        retried,
        queue: engine.host_prompts(&host_id).await,
    })
}

async fn create_session(
    State(engine): State<Arc<SyncEngine>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = engine.create_session(NewSession::from(request)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = engine.list_sessions(query.desired_state).await?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn get_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(engine.get_session(&session_id).await?))
}

async fn get_interaction(
    State(engine): State<Arc<SyncEngine>>,
    Path((session_id, interaction_id)): Path<(String, String)>,
) -> Result<Json<Interaction>, ApiError> {
    Ok(Json(
        engine.get_interaction(&session_id, &interaction_id).await?,
    ))
}

async fn post_prompt(
    State(engine): State<Arc<SyncEngine>>,
    Path(session_id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> Result<(StatusCode, Json<PromptResponse>), ApiError> {
    let outcome = engine.submit_prompt(&session_id, request.content).await?;
    Ok((StatusCode::ACCEPTED, Json(PromptResponse::from(outcome))))
}

async fn finish_session(
    State(engine): State<Arc<SyncEngine>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(engine.finish_session(&session_id).await?))
}

async fn set_desired_state(
    State(engine): State<Arc<SyncEngine>>,
    Path(session_id): Path<String>,
    Json(request): Json<DesiredStateRequest>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(
        engine
            .set_desired_state(&session_id, request.desired_state)
            .await?,
    ))
}

async fn get_events_sse(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let filter = query.session_id;
    let stream = BroadcastStream::new(engine.subscribe()).filter_map(move |result| {
        let filter = filter.clone();
        async move {
            match result {
                Ok(event) => {
                    if let Some(session_id) = filter.as_deref() {
                        if event.event.session_id() != session_id {
                            return None;
                        }
                    }
                    Some(Ok::<Event, Infallible>(to_sse_event(&event)))
                }
                Err(err) => {
                    tracing::warn!(error = %err, "subscriber lagged; skipping ahead");
                    None
                }
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE))
}

fn to_sse_event(event: &SequencedEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .event(event.event.kind())
        .json_data(&event.event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::SyncConfig;
    use crate::store::MemorySessionStore;

    fn router() -> Router {
        let engine = SyncEngine::new(
            SyncConfig::default(),
            Arc::new(MemorySessionStore::new()),
            None,
        );
        build_router(engine)
    }

    #[tokio::test]
    async fn missing_session_is_problem_json() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/v1/sessions/ses_missing")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let problem: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(problem["type"], "urn:agent-sync:error:session_not_found");
        assert_eq!(problem["status"], 404);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
