// ABOUTME: HTTP request handlers for file access inside a running session's sandbox
// ABOUTME: Paths are validated before they reach the provider

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::response::{ok, ApiResult};
use crate::state::AppState;
use corral_sandbox::{validate_sandbox_path, FileEntry};

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileBody {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct MakeDirBody {
    pub path: String,
}

#[derive(Serialize)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: usize,
    /// Set when the bytes were not valid UTF-8 and were decoded lossily
    pub lossy: bool,
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult {
    let path = validate_sandbox_path(&query.path)?;
    let sandbox = state.registry.running_sandbox(&session_id).await?;
    let entries = state
        .registry
        .provider()
        .list_files(&sandbox, &path)
        .await?;
    ok(DirectoryListing { path, entries })
}

pub async fn read_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult {
    let path = validate_sandbox_path(&query.path)?;
    let sandbox = state.registry.running_sandbox(&session_id).await?;
    let bytes = state.registry.provider().read_file(&sandbox, &path).await?;

    let size = bytes.len();
    let (content, lossy) = match String::from_utf8(bytes) {
        Ok(text) => (text, false),
        Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), true),
    };
    ok(FileContent {
        path,
        content,
        size,
        lossy,
    })
}

pub async fn write_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<WriteFileBody>,
) -> ApiResult {
    let path = validate_sandbox_path(&body.path)?;
    let sandbox = state.registry.running_sandbox(&session_id).await?;
    let size = body.content.len();
    state
        .registry
        .provider()
        .write_file(&sandbox, &path, body.content.into_bytes())
        .await?;

    info!(session_id = %session_id, path = %path, size, "File written");
    ok(json!({ "path": path, "size": size }))
}

pub async fn delete_path(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult {
    let path = validate_sandbox_path(&query.path)?;
    let sandbox = state.registry.running_sandbox(&session_id).await?;
    state
        .registry
        .provider()
        .delete_path(&sandbox, &path, query.recursive)
        .await?;

    info!(session_id = %session_id, path = %path, "Path deleted");
    ok(json!({ "path": path, "deleted": true }))
}

pub async fn make_dir(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<MakeDirBody>,
) -> ApiResult {
    let path = validate_sandbox_path(&body.path)?;
    let sandbox = state.registry.running_sandbox(&session_id).await?;
    state.registry.provider().make_dir(&sandbox, &path).await?;
    ok(json!({ "path": path, "created": true }))
}
