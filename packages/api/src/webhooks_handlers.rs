// ABOUTME: HTTP request handlers for webhook registration and delivery history
// ABOUTME: Registration is validated by the dispatcher; deliveries are read-only

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::response::{ok, with_status, ApiResult};
use crate::state::AppState;

const DEFAULT_DELIVERY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookBody {
    pub url: String,
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_webhooks(State(state): State<AppState>) -> ApiResult {
    ok(state.webhooks.list().await?)
}

pub async fn register_webhook(
    State(state): State<AppState>,
    Json(body): Json<RegisterWebhookBody>,
) -> ApiResult {
    let webhook = state.webhooks.register(&body.url, &body.events).await?;
    with_status(StatusCode::CREATED, webhook)
}

pub async fn get_webhook(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(state.webhooks.get(&id).await?)
}

pub async fn unregister_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state.webhooks.unregister(&id).await?;
    ok(json!({ "id": id, "deleted": true }))
}

pub async fn set_webhook_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetEnabledBody>,
) -> ApiResult {
    ok(state.webhooks.set_enabled(&id, body.enabled).await?)
}

/// Delivery records for one webhook, newest first
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT);
    if limit < 1 {
        return Err(AppError::Validation("limit must be positive".to_string()));
    }
    ok(state.webhooks.deliveries(&id, limit).await?)
}
