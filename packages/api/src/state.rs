// ABOUTME: Shared handler state holding the engine components
// ABOUTME: Every component is constructed by the binary and injected here

use corral_executions::ExecutionRunner;
use corral_sessions::{SessionMonitor, SessionRegistry};
use corral_stream::StreamGateway;
use corral_webhooks::WebhookDispatcher;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub runner: ExecutionRunner,
    pub gateway: Arc<StreamGateway>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub monitor: Arc<SessionMonitor>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        runner: ExecutionRunner,
        gateway: Arc<StreamGateway>,
        webhooks: Arc<WebhookDispatcher>,
        monitor: Arc<SessionMonitor>,
    ) -> Self {
        Self {
            registry,
            runner,
            gateway,
            webhooks,
            monitor,
        }
    }
}
