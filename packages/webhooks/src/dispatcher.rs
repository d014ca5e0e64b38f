// ABOUTME: Fan-out of webhook events to subscribers with bounded, exponentially backed-off retries
// ABOUTME: Events arrive on an unbounded queue so callers never wait on delivery

use crate::error::{Result, WebhookError};
use crate::storage::WebhookStorage;
use crate::transport::{OutboundRequest, WebhookTransport};
use crate::types::{Delivery, DeliveryStatus, Webhook, WebhookEvent, WebhookEventKind};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): doubles each time, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// A delivery ready to attempt, with the URL it goes to
struct Job {
    delivery: Delivery,
    url: String,
}

enum Command {
    Event(WebhookEvent),
    Resume(Vec<Job>),
    Flush(oneshot::Sender<()>),
}

pub struct WebhookDispatcher {
    storage: WebhookStorage,
    sender: mpsc::UnboundedSender<Command>,
}

impl WebhookDispatcher {
    /// Create the dispatcher and spawn its worker; requires a Tokio runtime
    pub fn new(
        storage: WebhookStorage,
        transport: Arc<dyn WebhookTransport>,
        policy: RetryPolicy,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            storage: storage.clone(),
            transport,
            policy,
        };
        tokio::spawn(worker.run(receiver));

        Self { storage, sender }
    }

    pub async fn register(&self, url: &str, events: &[String]) -> Result<Webhook> {
        let url = validate_url(url)?;
        if events.is_empty() {
            return Err(WebhookError::InvalidEvent(
                "at least one event is required".to_string(),
            ));
        }
        let events = events
            .iter()
            .map(|name| {
                WebhookEventKind::parse(name.trim())
                    .ok_or_else(|| WebhookError::InvalidEvent(name.clone()))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        let webhook = Webhook {
            id: corral_storage::generate_id("whk"),
            url,
            events,
            enabled: true,
            created_at: Utc::now(),
        };
        self.storage.insert_webhook(&webhook).await?;

        info!(webhook_id = %webhook.id, url = %webhook.url, "Registered webhook");
        Ok(webhook)
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.storage.delete_webhook(id).await?;
        info!(webhook_id = %id, "Unregistered webhook");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Webhook>> {
        Ok(self.storage.list_webhooks().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Webhook> {
        Ok(self.storage.get_webhook(id).await?)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Webhook> {
        self.storage.set_enabled(id, enabled).await?;
        self.get(id).await
    }

    pub async fn deliveries(&self, webhook_id: &str, limit: i64) -> Result<Vec<Delivery>> {
        self.storage.get_webhook(webhook_id).await?;
        Ok(self.storage.list_deliveries(webhook_id, limit).await?)
    }

    /// Queue an event for every enabled subscriber; never waits on delivery
    pub fn dispatch(&self, event: WebhookEvent) {
        debug!(
            event_id = %event.id,
            kind = %event.kind,
            execution_id = %event.execution_id,
            "Queueing webhook event"
        );
        if self.sender.send(Command::Event(event)).is_err() {
            error!("Webhook worker is gone; event dropped");
        }
    }

    /// Re-queue deliveries left Pending by a previous run
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.storage.pending_deliveries().await?;
        let mut jobs = Vec::with_capacity(pending.len());

        for delivery in pending {
            let webhook = self.storage.get_webhook(&delivery.webhook_id).await?;
            if !webhook.enabled {
                self.storage
                    .update_delivery(
                        &delivery.id,
                        DeliveryStatus::Failed,
                        delivery.attempts,
                        delivery.last_status_code,
                        Some("webhook disabled"),
                    )
                    .await?;
                continue;
            }
            jobs.push(Job {
                delivery,
                url: webhook.url,
            });
        }

        let count = jobs.len();
        if count > 0 {
            info!("Resuming {} pending webhook deliveries", count);
            if self.sender.send(Command::Resume(jobs)).is_err() {
                error!("Webhook worker is gone; pending deliveries not resumed");
            }
        }
        Ok(count)
    }

    /// Wait until every event queued so far has finished delivering
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

fn validate_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(WebhookError::InvalidUrl(format!(
                "unsupported scheme {}",
                other
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(WebhookError::InvalidUrl(format!("{} has no host", raw)));
    }
    Ok(parsed.to_string())
}

struct Worker {
    storage: WebhookStorage,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(Command::Event(event)) => {
                        for job in self.fan_out(&event).await {
                            self.spawn(&mut in_flight, job);
                        }
                    }
                    Some(Command::Resume(jobs)) => {
                        for job in jobs {
                            self.spawn(&mut in_flight, job);
                        }
                    }
                    Some(Command::Flush(done)) => {
                        while let Some(joined) = in_flight.join_next().await {
                            log_join(joined);
                        }
                        let _ = done.send(());
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
            }
        }

        // Let deliveries already under way finish
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        debug!("Webhook worker stopped");
    }

    /// One Pending delivery record per subscriber
    async fn fan_out(&self, event: &WebhookEvent) -> Vec<Job> {
        let subscribers = match self.storage.subscribers(event.kind).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!(event_id = %event.id, "Failed to load webhook subscribers: {}", e);
                return Vec::new();
            }
        };
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_id = %event.id, "Failed to serialize webhook event: {}", e);
                return Vec::new();
            }
        };

        let mut jobs = Vec::with_capacity(subscribers.len());
        for webhook in subscribers {
            let delivery = Delivery::pending(&webhook.id, event, payload.clone());
            if let Err(e) = self.storage.insert_delivery(&delivery).await {
                error!(webhook_id = %webhook.id, "Failed to record webhook delivery: {}", e);
                continue;
            }
            jobs.push(Job {
                delivery,
                url: webhook.url,
            });
        }
        jobs
    }

    fn spawn(&self, in_flight: &mut JoinSet<()>, job: Job) {
        let storage = self.storage.clone();
        let transport = Arc::clone(&self.transport);
        let policy = self.policy.clone();
        in_flight.spawn(deliver(storage, transport, policy, job));
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Webhook delivery task failed: {}", e);
    }
}

/// Attempt until a 2xx response or the retry budget is spent
async fn deliver(
    storage: WebhookStorage,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    job: Job,
) {
    let Job { delivery, url } = job;
    let request = OutboundRequest {
        url,
        event_kind: delivery.event_kind.as_str().to_string(),
        delivery_id: delivery.id.clone(),
        body: delivery.payload.clone(),
    };
    let budget = policy.max_retries.saturating_add(1);
    let mut attempts = delivery.attempts;

    loop {
        attempts += 1;
        let (status_code, failure) = match transport.post(&request).await {
            Ok(code) if (200..300).contains(&code) => {
                info!(
                    webhook_id = %delivery.webhook_id,
                    delivery_id = %delivery.id,
                    attempts,
                    "Webhook delivered"
                );
                record(&storage, &delivery.id, DeliveryStatus::Delivered, attempts, Some(code), None).await;
                return;
            }
            Ok(code) => (Some(code), format!("HTTP {}", code)),
            Err(e) => (None, e.to_string()),
        };

        if attempts >= budget {
            warn!(
                webhook_id = %delivery.webhook_id,
                delivery_id = %delivery.id,
                attempts,
                "Webhook delivery failed permanently: {}", failure
            );
            record(&storage, &delivery.id, DeliveryStatus::Failed, attempts, status_code, Some(&failure)).await;
            return;
        }

        let wait = policy.backoff(attempts);
        debug!(
            webhook_id = %delivery.webhook_id,
            delivery_id = %delivery.id,
            attempts,
            "Webhook attempt failed ({}), retrying in {:?}", failure, wait
        );
        record(&storage, &delivery.id, DeliveryStatus::Pending, attempts, status_code, Some(&failure)).await;
        tokio::time::sleep(wait).await;
    }
}

async fn record(
    storage: &WebhookStorage,
    delivery_id: &str,
    status: DeliveryStatus,
    attempts: u32,
    status_code: Option<u16>,
    error: Option<&str>,
) {
    if let Err(e) = storage
        .update_delivery(delivery_id, status, attempts, status_code, error)
        .await
    {
        error!(delivery_id = %delivery_id, "Failed to update webhook delivery: {}", e);
    }
}
