//! HTTP router: health endpoint plus the WebSocket admission paths.

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use sfu_core::System;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub system: Arc<System>,
}

/// Create the HTTP router with all routes.
///
/// `/server` carries application-server registrations, `/client` carries
/// end-user sessions, and any unmatched path falls back to the client
/// handler. The origin policy is permissive; tightening it is a
/// deployment concern.
pub fn create_router(system: Arc<System>) -> Router {
    let state = AppState { system };

    Router::new()
        .route("/health", get(health::health_check))
        .route("/server", get(websocket::server_handler))
        .route("/client", get(websocket::client_handler))
        .fallback(websocket::client_handler)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
