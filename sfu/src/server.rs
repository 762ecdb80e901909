//! Server lifecycle management
//!
//! Owns the HTTP/WebSocket listener and the background tasks (keyframe
//! dispatcher, idle-room reaper). The process only exits on a fatal bind
//! error or an OS signal.

use std::sync::Arc;
use tracing::info;

use sfu_core::{Config, System};

pub struct SfuServer {
    config: Config,
    system: Arc<System>,
}

impl SfuServer {
    pub const fn new(config: Config, system: Arc<System>) -> Self {
        Self { config, system }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let _background = self.system.spawn_background_tasks();
        info!(
            keyframe_interval_seconds = self.config.signaling.keyframe_interval_seconds,
            reap_interval_seconds = self.config.rooms.reap_interval_seconds,
            "background tasks started"
        );

        let router = sfu_api::http::create_router(Arc::clone(&self.system));
        let addr = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(address = %addr, "listening");
        info!("endpoints: /server (registration), /client (sessions), /health");

        axum::serve(listener, router).await?;
        Ok(())
    }
}
