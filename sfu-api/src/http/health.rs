//! Health check endpoint
//!
//! Provides a simple health probe for monitoring systems.

use axum::{response::IntoResponse, Json};
use serde_json::json;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "sfu",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
