// ABOUTME: HTTP request handlers for agent executions within a session
// ABOUTME: Submission (optionally blocking), history, lookup and cancellation

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::response::{ok, with_status, ApiResult};
use crate::sessions_handlers::PageQuery;
use crate::state::AppState;
use corral_executions::{Execution, ExecutionParams};

/// Request body for submitting an execution
#[derive(Debug, Deserialize)]
pub struct SubmitExecutionBody {
    pub prompt: String,
    #[serde(flatten)]
    pub params: ExecutionParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    /// Block until the execution reaches a terminal status
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Submit a prompt to the session's agent
///
/// Returns 202 with the Running record, or 200 with the terminal record
/// when `wait=true`.
pub async fn submit_execution(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<SubmitExecutionBody>,
) -> ApiResult {
    let handle = state
        .runner
        .submit(&session_id, &body.prompt, body.params)
        .await?;

    if query.wait {
        let execution = handle.wait().await?;
        ok(execution)
    } else {
        with_status(StatusCode::ACCEPTED, handle.execution().clone())
    }
}

/// Execution history, newest first
pub async fn list_executions(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult {
    let (limit, offset) = query.resolve()?;
    let (executions, total) = state.runner.list(&session_id, limit, offset).await?;
    ok(ExecutionPage {
        executions,
        total,
        limit,
        offset,
    })
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path((session_id, execution_id)): Path<(String, String)>,
) -> ApiResult {
    ok(state.runner.get(&session_id, &execution_id).await?)
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path((session_id, execution_id)): Path<(String, String)>,
) -> ApiResult {
    let cancelled = state.runner.cancel(&session_id, &execution_id).await?;
    ok(json!({
        "execution_id": execution_id,
        "cancelled": cancelled,
    }))
}
