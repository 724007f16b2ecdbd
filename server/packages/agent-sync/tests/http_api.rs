mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::*;

#[tokio::test]
async fn session_lifecycle_over_http() {
    let test_app = TestApp::new();

    let (status, created) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "hostId": HOST, "name": "deploy" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "deploy");
    assert_eq!(created["hostId"], HOST);
    assert_eq!(created["desiredState"], "running");
    assert_eq!(created["workState"], "idle");
    let session_id = created["id"].as_str().expect("session id").to_string();

    let (status, fetched) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], session_id.as_str());

    let (status, finished) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/finish"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["workState"], "done");
    assert_eq!(finished["desiredState"], "stopped");

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/prompts"),
        Some(json!({ "content": "one more thing" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:agent-sync:error:conflict");
}

#[tokio::test]
async fn create_session_requires_host() {
    let test_app = TestApp::new();
    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "hostId": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agent-sync:error:invalid_request");
}

#[tokio::test]
async fn list_sessions_filters_by_desired_state() {
    let test_app = TestApp::new();
    let keep = test_app.create_session(HOST, "keep").await;
    let parked = test_app.create_session(HOST, "parked").await;

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{}/desired-state", parked.id),
        Some(json!({ "desiredState": "stopped" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, all) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all["sessions"].as_array().expect("sessions").len(), 2);

    let (status, running) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions?desired_state=running",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let running = running["sessions"].as_array().expect("sessions");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0]["id"], keep.id.as_str());
}

#[tokio::test]
async fn prompt_for_disconnected_host_is_rejected() {
    let test_app = TestApp::new();
    let session = test_app.create_session(HOST, "offline").await;

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{}/prompts", session.id),
        Some(json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:agent-sync:error:host_not_connected");

    let (status, snapshot) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/hosts/{HOST}/prompts"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["failed"].as_array().expect("failed").len(), 1);
    assert!(snapshot["inFlight"].is_null());
}

#[tokio::test]
async fn prompt_is_dispatched_then_queued() {
    let test_app = TestApp::new();
    let mut host = test_app.connect(HOST);
    host.ready().await;
    let session = test_app.create_session(HOST, "busy").await;
    let path = format!("/v1/sessions/{}/prompts", session.id);

    let (status, first) = send_json(
        &test_app.app,
        Method::POST,
        &path,
        Some(json!({ "content": "first" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["status"], "dispatched");
    assert!(first.get("position").is_none());

    let (status, second) = send_json(
        &test_app.app,
        Method::POST,
        &path,
        Some(json!({ "content": "second" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["status"], "queued");
    assert_eq!(second["position"], 1);

    let prompt = host.expect_prompt();
    assert_eq!(prompt.content, "first");

    let (_, fetched) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{}", session.id),
        None,
    )
    .await;
    assert_eq!(fetched["workState"], "working");
    let interaction_id = fetched["currentInteractionId"]
        .as_str()
        .expect("interaction id");

    let (status, interaction) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{}/interactions/{interaction_id}", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(interaction["prompt"], "first");
    assert_eq!(interaction["completed"], false);
}

#[tokio::test]
async fn empty_prompt_is_invalid() {
    let test_app = TestApp::new();
    let session = test_app.create_session(HOST, "blank").await;
    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{}/prompts", session.id),
        Some(json!({ "content": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agent-sync:error:invalid_request");
}

#[tokio::test]
async fn unknown_interaction_is_not_found() {
    let test_app = TestApp::new();
    let session = test_app.create_session(HOST, "empty").await;
    let (status, problem) = send_json(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{}/interactions/int_missing", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["type"], "urn:agent-sync:error:interaction_not_found");
}

#[tokio::test]
async fn hosts_and_raw_commands() {
    let test_app = TestApp::new();
    let mut host = test_app.connect(HOST);

    let (status, hosts) = send_json(&test_app.app, Method::GET, "/v1/hosts", None).await;
    assert_eq!(status, StatusCode::OK);
    let hosts = hosts["hosts"].as_array().expect("hosts");
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0]["hostId"], HOST);
    assert_eq!(hosts[0]["readiness"], "connecting");

    let (status, response) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/hosts/{HOST}/commands"),
        Some(json!({ "type": "query_state" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["outcome"], "queued");
    assert!(host.next_command().is_none());

    host.ready().await;
    assert!(matches!(
        host.next_command(),
        Some(agent_sync::protocol::Command::QueryState)
    ));

    let (status, response) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/hosts/{HOST}/commands"),
        Some(json!({ "type": "open_thread", "thread_id": "thread-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["outcome"], "sent");

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/hosts/{HOST}/commands"),
        Some(json!({
            "type": "submit_prompt",
            "thread_id": null,
            "content": "sneaky",
            "request_id": "req_1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agent-sync:error:invalid_request");

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/hosts/host-z/commands",
        Some(json!({ "type": "query_state" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:agent-sync:error:host_not_connected");
}

#[tokio::test]
async fn failed_prompts_are_retried_over_http() {
    let test_app = TestApp::new();
    let session = test_app.create_session(HOST, "offline first").await;
    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{}/prompts", session.id),
        Some(json!({ "content": "hello again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let mut host = test_app.connect(HOST);
    host.ready().await;
    let (status, retried) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/hosts/{HOST}/prompts/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["retried"], 1);
    assert_eq!(retried["queue"]["inFlight"]["content"], "hello again");
    assert_eq!(retried["queue"]["inFlight"]["status"], "sent");
    assert!(retried["queue"]["failed"]
        .as_array()
        .expect("failed")
        .is_empty());

    let prompt = host.expect_prompt();
    assert_eq!(prompt.content, "hello again");

    let (_, again) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/hosts/{HOST}/prompts/retry"),
        None,
    )
    .await;
    assert_eq!(again["retried"], 0);
    assert!(host.next_command().is_none());
}
