mod server;

use anyhow::Result;
use tracing::info;

use sfu_core::{logging, Config, System};

use server::SfuServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (defaults <- optional file <- environment)
    let config_file = std::env::args().nth(1);
    let config = Config::load(config_file.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("SFU server starting...");
    info!(
        address = %config.http_address(),
        stun_servers = ?config.webrtc.stun_servers,
        auto_create_rooms = config.rooms.auto_create_on_join,
        "configuration loaded"
    );

    // 3. Build the system root: registries plus signaling coordinator
    let system = System::new(config.clone());

    // 4. Run the server (spawns the keyframe ticker and room reaper)
    let server = SfuServer::new(config, system);
    server.start().await
}
