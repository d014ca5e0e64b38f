// ABOUTME: Liveness endpoint
// ABOUTME: Reports service identity and version without touching any component

use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "status": "healthy",
            "timestamp": Utc::now().timestamp(),
            "version": env!("CARGO_PKG_VERSION"),
            "service": "corral"
        },
        "error": null
    }))
}
