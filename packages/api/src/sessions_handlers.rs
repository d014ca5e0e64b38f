// ABOUTME: HTTP request handlers for session lifecycle operations
// ABOUTME: Create, inspect, start, stop, reconnect and delete sessions

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::response::{ok, with_status, ApiResult};
use crate::state::AppState;
use corral_sessions::{HealthCheck, Session};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Query parameters shared by paginated listings
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageQuery {
    pub fn resolve(&self) -> Result<(i64, i64), AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if offset < 0 {
            return Err(AppError::Validation("offset must not be negative".to_string()));
        }
        Ok((limit, offset))
    }
}

#[derive(Serialize)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Request body for creating a session
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub start: bool,
}

/// List sessions, newest first
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let (limit, offset) = query.resolve()?;
    let (sessions, total) = state.registry.list(limit, offset).await?;
    ok(SessionPage {
        sessions,
        total,
        limit,
        offset,
    })
}

/// Create a session, optionally starting it right away
pub async fn create_session(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request = if body.is_empty() {
        CreateSessionBody::default()
    } else {
        serde_json::from_slice::<CreateSessionBody>(&body)
            .map_err(|e| AppError::Validation(format!("invalid request body: {}", e)))?
    };

    let session = state.registry.create().await?;
    info!(session_id = %session.id, start = request.start, "Session created via API");

    let session = if request.start {
        state.registry.start(&session.id).await?
    } else {
        session
    };
    with_status(StatusCode::CREATED, session)
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.registry.get(&id).await?)
}

pub async fn start_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.registry.start(&id).await?)
}

pub async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.registry.stop(&id).await?)
}

pub async fn reconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    ok(state.registry.reconnect(&id).await?)
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.registry.delete(&id).await?;
    state.gateway.close_session(&id);
    state.monitor.clear_checks(&id).await;
    ok(json!({ "id": id, "deleted": true }))
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SessionHealth {
    pub session_id: String,
    pub checks: Vec<HealthCheck>,
}

/// Recent sandbox health checks recorded by the monitor
pub async fn session_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HealthQuery>,
) -> ApiResult {
    state.registry.get(&id).await?;
    let checks = state.monitor.recent_checks(&id, query.limit).await;
    ok(SessionHealth {
        session_id: id,
        checks,
    })
}
