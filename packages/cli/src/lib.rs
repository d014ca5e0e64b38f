// ABOUTME: Engine wiring and HTTP server startup for the corral binary
// ABOUTME: Builds every component from EngineConfig, recovers state, then serves until shutdown

pub mod error;

use axum::http::{HeaderValue, Method};
use corral_api::{create_router, AppState};
use corral_config::EngineConfig;
use corral_executions::{ExecutionRunner, ExecutionStorage, RunnerSettings};
use corral_sandbox::SandboxProvider;
use corral_sessions::{SessionMonitor, SessionRegistry, SessionStorage};
use corral_stream::StreamGateway;
use corral_webhooks::{RetryPolicy, WebhookDispatcher, WebhookStorage, WebhookTransport};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use error::{Result, ServerError};

/// Every long-lived component, constructed once per process
pub struct Engine {
    pub state: AppState,
    pub monitor: Arc<SessionMonitor>,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl Engine {
    /// Connect storage, recover interrupted work and start background tasks
    pub async fn start(
        config: &EngineConfig,
        provider: Arc<dyn SandboxProvider>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<Self> {
        let pool = corral_storage::connect(&config.database_url).await?;
        info!(provider = provider.name(), "Using sandbox provider");

        let registry = Arc::new(SessionRegistry::new(
            SessionStorage::new(pool.clone()),
            provider,
        ));
        let recovered = registry.recover().await?;

        let gateway = Arc::new(StreamGateway::new(
            config.stream.channel_size,
            config.stream.heartbeat_interval,
        ));

        let webhooks = Arc::new(WebhookDispatcher::new(
            WebhookStorage::new(pool.clone()),
            transport,
            RetryPolicy {
                max_retries: config.webhooks.max_retries,
                initial_backoff: config.webhooks.initial_backoff,
                max_backoff: config.webhooks.max_backoff,
            },
        ));
        let resumed = webhooks.recover_pending().await?;

        let runner = ExecutionRunner::new(
            registry.clone(),
            ExecutionStorage::new(pool),
            gateway.clone(),
            Some(webhooks.clone()),
            RunnerSettings {
                agent_program: config.runner.agent_program.clone(),
                tool_catalog: config.runner.tool_catalog.iter().cloned().collect(),
                require_tools: config.runner.require_tools,
                working_dir: Some(config.sandbox.working_dir.clone()),
            },
        );
        let failed = runner.recover().await?;

        let monitor = Arc::new(SessionMonitor::new(
            registry.clone(),
            config.monitor.health_check_interval,
            config.monitor.idle_timeout,
        ));
        monitor.clone().start().await;

        info!(
            recovered_sessions = recovered,
            failed_executions = failed,
            resumed_deliveries = resumed,
            "Engine started"
        );

        Ok(Self {
            state: AppState::new(registry, runner, gateway, webhooks.clone(), monitor.clone()),
            monitor,
            webhooks,
        })
    }

    /// Stop background work; pending webhook deliveries get a chance to finish
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.webhooks.flush().await;
        info!("Engine stopped");
    }
}

pub fn cors_layer(origin: Option<&str>) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Ok(match origin {
        Some(origin) => layer.allow_origin(
            origin
                .parse::<HeaderValue>()
                .map_err(|_| ServerError::InvalidCorsOrigin(origin.to_string()))?,
        ),
        None => layer.allow_origin(Any),
    })
}

/// Serve the API until ctrl-c, then shut the engine down
pub async fn run_server(config: EngineConfig, engine: Engine) -> Result<()> {
    let app = create_router(engine.state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config.server.cors_origin.as_deref())?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.shutdown().await;
    served?;
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corral_sandbox::ScriptedProvider;
    use corral_sessions::SessionState;
    use corral_webhooks::OutboundRequest;

    struct NoopTransport;

    #[async_trait]
    impl WebhookTransport for NoopTransport {
        async fn post(&self, _request: &OutboundRequest) -> corral_webhooks::Result<u16> {
            Ok(204)
        }
    }

    fn config_for(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database_url = format!("sqlite://{}", dir.path().join("corral.db").display());
        config
    }

    #[test]
    fn test_cors_origin_validation() {
        assert!(cors_layer(None).is_ok());
        assert!(cors_layer(Some("http://localhost:5173")).is_ok());
        assert!(matches!(
            cors_layer(Some("bad\norigin")),
            Err(ServerError::InvalidCorsOrigin(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_recovers_interrupted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(&dir);

        let engine = Engine::start(
            &config,
            Arc::new(ScriptedProvider::new()),
            Arc::new(NoopTransport),
        )
        .await
        .unwrap();
        let session = engine.state.registry.create().await.unwrap();
        engine.state.registry.start(&session.id).await.unwrap();
        engine.shutdown().await;
        drop(engine);

        let restarted = Engine::start(
            &config,
            Arc::new(ScriptedProvider::new()),
            Arc::new(NoopTransport),
        )
        .await
        .unwrap();
        let recovered = restarted.state.registry.get(&session.id).await.unwrap();
        assert_eq!(recovered.state, SessionState::Error);
        assert!(recovered.sandbox.is_some());
        restarted.shutdown().await;
    }
}
