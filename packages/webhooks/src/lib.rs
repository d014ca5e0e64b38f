// ABOUTME: Webhook registrations and asynchronous, retrying delivery of execution outcomes
// ABOUTME: Deliveries are persisted so that outcomes stay queryable and retries survive restarts

pub mod dispatcher;
pub mod error;
pub mod storage;
pub mod transport;
pub mod types;

pub use dispatcher::{RetryPolicy, WebhookDispatcher};
pub use error::{Result, WebhookError};
pub use storage::WebhookStorage;
pub use transport::{HttpTransport, OutboundRequest, WebhookTransport};
pub use types::{Delivery, DeliveryStatus, Webhook, WebhookEvent, WebhookEventKind};
