// ABOUTME: Integration tests for webhook fan-out, retries and the persisted retry queue
// ABOUTME: A scripted transport stands in for the receiving HTTP endpoints

use async_trait::async_trait;
use corral_webhooks::{
    DeliveryStatus, OutboundRequest, RetryPolicy, WebhookDispatcher, WebhookError, WebhookEvent,
    WebhookEventKind, WebhookStorage, WebhookTransport,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers each POST with the next scripted outcome, then with 200
#[derive(Default)]
struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<u16, String>>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    fn with_outcomes(outcomes: Vec<Result<u16, String>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(&self, request: &OutboundRequest) -> corral_webhooks::Result<u16> {
        self.requests.lock().unwrap().push(request.clone());
        match self.outcomes.lock().unwrap().pop_front() {
            Some(Ok(code)) => Ok(code),
            Some(Err(message)) => Err(WebhookError::Transport(message)),
            None => Ok(200),
        }
    }
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

async fn setup(
    transport: Arc<ScriptedTransport>,
    max_retries: u32,
) -> (WebhookDispatcher, WebhookStorage) {
    let pool = corral_storage::connect_in_memory().await.unwrap();
    let storage = WebhookStorage::new(pool);
    let dispatcher = WebhookDispatcher::new(storage.clone(), transport, fast_policy(max_retries));
    (dispatcher, storage)
}

fn completed_event() -> WebhookEvent {
    WebhookEvent::new(
        WebhookEventKind::ExecutionCompleted,
        "ses_1",
        "exe_1",
        json!({"status": "succeeded"}),
    )
}

#[tokio::test]
async fn test_three_failures_then_success_is_delivered() {
    let transport = ScriptedTransport::with_outcomes(vec![
        Ok(500),
        Err("connection refused".to_string()),
        Ok(503),
        Ok(204),
    ]);
    let (dispatcher, _storage) = setup(transport.clone(), 3).await;
    let webhook = dispatcher
        .register(
            "https://hooks.example.com/done",
            &["execution.completed".to_string()],
        )
        .await
        .unwrap();

    dispatcher.dispatch(completed_event());
    dispatcher.flush().await;

    let deliveries = dispatcher.deliveries(&webhook.id, 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    assert_eq!(deliveries[0].attempts, 4);
    assert_eq!(deliveries[0].last_status_code, Some(204));
    assert_eq!(transport.requests().len(), 4);
}

#[tokio::test]
async fn test_exhausted_retries_are_recorded_failed() {
    let transport = ScriptedTransport::with_outcomes(vec![Ok(500); 10]);
    let (dispatcher, _storage) = setup(transport.clone(), 2).await;
    let webhook = dispatcher
        .register(
            "https://hooks.example.com/done",
            &["execution.completed".to_string()],
        )
        .await
        .unwrap();

    dispatcher.dispatch(completed_event());
    dispatcher.flush().await;

    let deliveries = dispatcher.deliveries(&webhook.id, 10).await.unwrap();
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    assert_eq!(deliveries[0].attempts, 3);
    assert_eq!(deliveries[0].last_error.as_deref(), Some("HTTP 500"));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn test_fan_out_only_to_enabled_subscribers() {
    let transport = ScriptedTransport::with_outcomes(vec![]);
    let (dispatcher, _storage) = setup(transport.clone(), 0).await;
    let both = dispatcher
        .register(
            "https://a.example.com/hook",
            &["execution.completed".to_string(), "execution.failed".to_string()],
        )
        .await
        .unwrap();
    dispatcher
        .register("https://b.example.com/hook", &["execution.failed".to_string()])
        .await
        .unwrap();
    let disabled = dispatcher
        .register("https://c.example.com/hook", &["execution.completed".to_string()])
        .await
        .unwrap();
    dispatcher.set_enabled(&disabled.id, false).await.unwrap();

    let event = completed_event();
    dispatcher.dispatch(event.clone());
    dispatcher.flush().await;

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, both.url);
    assert_eq!(requests[0].event_kind, "execution.completed");
    assert_eq!(requests[0].body["id"], event.id.as_str());
    assert!(requests[0].delivery_id.starts_with("dlv_"));
}

#[tokio::test]
async fn test_register_validation() {
    let transport = ScriptedTransport::with_outcomes(vec![]);
    let (dispatcher, _storage) = setup(transport, 0).await;

    assert!(matches!(
        dispatcher
            .register("file:///etc/passwd", &["execution.completed".to_string()])
            .await,
        Err(WebhookError::InvalidUrl(_))
    ));
    assert!(matches!(
        dispatcher.register("https://example.com", &[]).await,
        Err(WebhookError::InvalidEvent(_))
    ));
    assert!(matches!(
        dispatcher
            .register("https://example.com", &["session.created".to_string()])
            .await,
        Err(WebhookError::InvalidEvent(_))
    ));
    assert!(matches!(
        dispatcher.unregister("whk_missing").await,
        Err(WebhookError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_pending_deliveries_resume_after_restart() {
    let pool = corral_storage::connect_in_memory().await.unwrap();
    let storage = WebhookStorage::new(pool);

    // The first dispatcher records one failed attempt and then sits in a
    // long backoff, like a process that died between retries
    let stalled = ScriptedTransport::with_outcomes(vec![Ok(502)]);
    let first = WebhookDispatcher::new(
        storage.clone(),
        stalled.clone(),
        RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(3600),
        },
    );
    let webhook = first
        .register("https://hooks.example.com/done", &["execution.completed".to_string()])
        .await
        .unwrap();
    first.dispatch(completed_event());

    let mut pending = Vec::new();
    for _ in 0..100 {
        pending = storage.list_deliveries(&webhook.id, 10).await.unwrap();
        if pending.first().map(|d| d.attempts) == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending[0].status, DeliveryStatus::Pending);
    assert_eq!(pending[0].attempts, 1);

    let healthy = ScriptedTransport::with_outcomes(vec![]);
    let second = WebhookDispatcher::new(storage.clone(), healthy.clone(), fast_policy(3));
    assert_eq!(second.recover_pending().await.unwrap(), 1);
    second.flush().await;

    let delivery = storage.get_delivery(&pending[0].id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(healthy.requests().len(), 1);
}
