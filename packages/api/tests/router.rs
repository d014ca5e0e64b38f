// ABOUTME: Router-level tests for the Corral HTTP API
// ABOUTME: Drives requests through the full router against an in-memory engine

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use corral_api::{create_router, stream_ws, AppState};
use corral_executions::{ExecutionRunner, ExecutionStorage, RunnerSettings};
use corral_sandbox::{ScriptedExec, ScriptedProvider};
use corral_sessions::{SessionMonitor, SessionRegistry, SessionStorage};
use corral_stream::{EventPayload, StreamGateway};
use corral_webhooks::{
    OutboundRequest, RetryPolicy, WebhookDispatcher, WebhookStorage, WebhookTransport,
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct AcceptAll;

#[async_trait]
impl WebhookTransport for AcceptAll {
    async fn post(&self, _request: &OutboundRequest) -> corral_webhooks::Result<u16> {
        Ok(200)
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    provider: Arc<ScriptedProvider>,
}

async fn test_app() -> TestApp {
    let pool = corral_storage::connect_in_memory().await.unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let registry = Arc::new(SessionRegistry::new(
        SessionStorage::new(pool.clone()),
        provider.clone(),
    ));
    let gateway = Arc::new(StreamGateway::new(64, Duration::from_secs(3600)));
    let webhooks = Arc::new(WebhookDispatcher::new(
        WebhookStorage::new(pool.clone()),
        Arc::new(AcceptAll),
        RetryPolicy::default(),
    ));
    let runner = ExecutionRunner::new(
        registry.clone(),
        ExecutionStorage::new(pool),
        gateway.clone(),
        Some(webhooks.clone()),
        RunnerSettings::default(),
    );
    let monitor = Arc::new(SessionMonitor::new(
        registry.clone(),
        Duration::from_secs(3600),
        Duration::ZERO,
    ));

    let state = AppState::new(registry, runner, gateway, webhooks, monitor);
    TestApp {
        router: create_router(state.clone()),
        state,
        provider,
    }
}

async fn send(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn running_session(app: &TestApp) -> String {
    let (status, body) = send(app, Method::POST, "/api/sessions", Some(json!({"start": true}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["state"], "running");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
}

#[tokio::test]
async fn test_session_lifecycle_endpoints() {
    let app = test_app().await;

    let (status, body) = send(&app, Method::POST, "/api/sessions", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["state"], "created");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::POST, &format!("/api/sessions/{}/start", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");

    // Running sessions cannot be started again
    let (status, body) = send(&app, Method::POST, &format!("/api/sessions/{}/start", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

    let (status, body) = send(&app, Method::POST, &format!("/api/sessions/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "stopped");

    let (status, body) = send(&app, Method::GET, "/api/sessions?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["sessions"][0]["id"], id.as_str());

    let (status, _) = send(&app, Method::DELETE, &format!("/api/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, Method::GET, &format!("/api/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let app = test_app().await;

    let (status, body) = send(&app, Method::GET, "/api/sessions?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(&app, Method::GET, "/api/nonexistent", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provisioning_failure_is_service_unavailable() {
    let app = test_app().await;
    app.provider.fail_next_provision("image pull failed");

    let (status, body) = send(&app, Method::POST, "/api/sessions", Some(json!({"start": true}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SANDBOX_UNAVAILABLE");

    // The session is left in Error and can be reconnected
    let (_, body) = send(&app, Method::GET, "/api/sessions", None).await;
    let session = &body["data"]["sessions"][0];
    assert_eq!(session["state"], "error");
    let id = session["id"].as_str().unwrap();
    let (status, body) = send(&app, Method::POST, &format!("/api/sessions/{}/reconnect", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");
}

#[tokio::test]
async fn test_submit_and_wait_for_execution() {
    let app = test_app().await;
    let id = running_session(&app).await;
    app.provider.push_exec(ScriptedExec::lines([
        r#"{"type":"assistant"}"#,
        r#"{"type":"result","subtype":"success","result":"all green"}"#,
    ]));

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/executions?wait=true", id),
        Some(json!({"prompt": "run the tests", "timeout_seconds": 30})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["response"], "all green");
    assert_eq!(body["data"]["turns"], 1);
    let execution_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/sessions/{}/executions/{}", id, execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["exit_code"], 0);

    let (_, body) = send(&app, Method::GET, &format!("/api/sessions/{}/executions", id), None).await;
    assert_eq!(body["data"]["total"], 1);
}

#[tokio::test]
async fn test_busy_session_and_cancel() {
    let app = test_app().await;
    let id = running_session(&app).await;
    app.provider
        .push_exec(ScriptedExec::Sleep(Duration::from_secs(30)));

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/executions", id),
        Some(json!({"prompt": "long task"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "running");
    let execution_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/executions", id),
        Some(json!({"prompt": "second"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SESSION_BUSY");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/executions/{}/cancel", id, execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cancelled"], true);

    // The slot frees once the run observes the cancellation
    let mut status = String::new();
    for _ in 0..100 {
        let (_, body) = send(
            &app,
            Method::GET,
            &format!("/api/sessions/{}/executions/{}", id, execution_id),
            None,
        )
        .await;
        status = body["data"]["status"].as_str().unwrap().to_string();
        if status != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "cancelled");
}

#[tokio::test]
async fn test_submit_to_idle_session() {
    let app = test_app().await;
    let (_, body) = send(&app, Method::POST, "/api/sessions", None).await;
    let id = body["data"]["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/executions", id),
        Some(json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SESSION_NOT_RUNNING");
}

#[tokio::test]
async fn test_file_endpoints() {
    let app = test_app().await;
    let id = running_session(&app).await;

    let (status, _) = send(
        &app,
        Method::PUT,
        &format!("/api/sessions/{}/files/content", id),
        Some(json!({"path": "/workspace/src/main.rs", "content": "fn main() {}"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/sessions/{}/files/content?path=/workspace/src/main.rs", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["content"], "fn main() {}");
    assert_eq!(body["data"]["lossy"], false);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/files/mkdir", id),
        Some(json!({"path": "/workspace/docs"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &app,
        Method::GET,
        &format!("/api/sessions/{}/files?path=/workspace", id),
        None,
    )
    .await;
    let names: Vec<&str> = body["data"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["docs", "src"]);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/api/sessions/{}/files?path=/workspace/src&recursive=true", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/sessions/{}/files/content?path=/workspace/../etc/passwd", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_webhook_endpoints() {
    let app = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/webhooks",
        Some(json!({"url": "https://hooks.example.com/corral", "events": ["execution.failed"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let webhook_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/webhooks",
        Some(json!({"url": "not a url", "events": ["execution.failed"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (_, body) = send(&app, Method::GET, "/api/webhooks", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/api/webhooks/{}/enabled", webhook_id),
        Some(json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/webhooks/{}/deliveries", webhook_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = send(&app, Method::DELETE, &format!("/api/webhooks/{}", webhook_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        Method::GET,
        &format!("/api/webhooks/{}/deliveries", webhook_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_messages_reply_to_sender_only() {
    let app = test_app().await;
    let id = running_session(&app).await;
    let mut observer = app.state.gateway.attach(&id);

    let reply = stream_ws::handle_inbound(&app.state, &id, r#"{"type":"ping"}"#)
        .await
        .unwrap();
    assert!(matches!(reply.payload, EventPayload::Pong));
    assert_eq!(reply.sequence, None);

    let reply = stream_ws::handle_inbound(&app.state, &id, "not json")
        .await
        .unwrap();
    assert!(matches!(
        reply.payload,
        EventPayload::Error { ref code, .. } if code == stream_ws::INVALID_MESSAGE_CODE
    ));

    app.provider
        .push_exec(ScriptedExec::Sleep(Duration::from_millis(200)));
    let reply = stream_ws::handle_inbound(
        &app.state,
        &id,
        r#"{"type":"execute","prompt":"first","timeout_seconds":30}"#,
    )
    .await;
    assert!(reply.is_none());

    let reply = stream_ws::handle_inbound(&app.state, &id, r#"{"type":"execute","prompt":"second"}"#)
        .await
        .unwrap();
    assert!(matches!(
        reply.payload,
        EventPayload::Error { ref code, .. } if code == "SESSION_BUSY"
    ));

    // Only the accepted submission is broadcast
    let event = tokio::time::timeout(Duration::from_secs(5), observer.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event.payload,
        EventPayload::ExecutionStarted { ref prompt, .. } if prompt == "first"
    ));
}
