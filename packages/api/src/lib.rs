// ABOUTME: HTTP and WebSocket API layer for Corral providing REST endpoints and routing
// ABOUTME: Integration layer that depends on all engine packages

use axum::{
    routing::{get, post, put},
    Router,
};

pub mod error;
pub mod executions_handlers;
pub mod files_handlers;
pub mod health;
pub mod response;
pub mod sessions_handlers;
pub mod state;
pub mod stream_ws;
pub mod webhooks_handlers;

pub use error::AppError;
pub use response::ApiResponse;
pub use state::AppState;

/// Creates the sessions API router (nested under /api/sessions)
pub fn create_sessions_router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(sessions_handlers::list_sessions).post(sessions_handlers::create_session),
        )
        .route(
            "/{id}",
            get(sessions_handlers::get_session).delete(sessions_handlers::delete_session),
        )
        .route("/{id}/start", post(sessions_handlers::start_session))
        .route("/{id}/stop", post(sessions_handlers::stop_session))
        .route("/{id}/reconnect", post(sessions_handlers::reconnect_session))
        .route("/{id}/health", get(sessions_handlers::session_health))
        .route("/{id}/stream", get(stream_ws::stream_session))
        // Executions
        .route(
            "/{id}/executions",
            get(executions_handlers::list_executions).post(executions_handlers::submit_execution),
        )
        .route(
            "/{id}/executions/{execution_id}",
            get(executions_handlers::get_execution),
        )
        .route(
            "/{id}/executions/{execution_id}/cancel",
            post(executions_handlers::cancel_execution),
        )
        // Sandbox files
        .route(
            "/{id}/files",
            get(files_handlers::list_files).delete(files_handlers::delete_path),
        )
        .route(
            "/{id}/files/content",
            get(files_handlers::read_file).put(files_handlers::write_file),
        )
        .route("/{id}/files/mkdir", post(files_handlers::make_dir))
}

/// Creates the webhooks API router (nested under /api/webhooks)
pub fn create_webhooks_router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(webhooks_handlers::list_webhooks).post(webhooks_handlers::register_webhook),
        )
        .route(
            "/{id}",
            get(webhooks_handlers::get_webhook).delete(webhooks_handlers::unregister_webhook),
        )
        .route("/{id}/enabled", put(webhooks_handlers::set_webhook_enabled))
        .route("/{id}/deliveries", get(webhooks_handlers::list_deliveries))
}

/// Full API router with state applied; middleware is layered by the binary
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_check))
        .nest("/api/sessions", create_sessions_router())
        .nest("/api/webhooks", create_webhooks_router())
        .with_state(state)
}
