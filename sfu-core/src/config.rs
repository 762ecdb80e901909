use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub webrtc: WebRtcConfig,
    pub rooms: RoomsConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN URLs handed to every peer connection.
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl WebRtcConfig {
    #[must_use]
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: self.stun_servers.clone(),
            ..Default::default()
        }]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Create a missing room on a validated client join, owned by the
    /// joining server. When false the join fails with `RoomNotFound`.
    pub auto_create_on_join: bool,
    /// A room empty for longer than this is reaped.
    pub max_idle_seconds: u64,
    /// How often the reaper scans for idle rooms.
    pub reap_interval_seconds: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            auto_create_on_join: true,
            max_idle_seconds: 1800,
            reap_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Upper bound on reconcile passes for a single trigger. After this the
    /// coordinator gives up; the next room change re-enters reconcile.
    pub max_reconcile_attempts: u32,
    /// Interval of the periodic PLI (keyframe request) dispatcher.
    pub keyframe_interval_seconds: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_reconcile_attempts: 10,
            keyframe_interval_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, "pretty" for development.
    pub format: String,
    pub file_path: Option<String>,
    /// Log a counter line every 1000 forwarded RTP packets per track.
    pub verbose_rtp: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            verbose_rtp: false,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Flat legacy environment variables (`PORT`, `STUN_SERVERS`,
    ///    `DEBUG`, `VERBOSE_LOG`), highest priority
    /// 2. `SFU_`-prefixed environment variables (`SFU_SERVER__PORT`, ...)
    /// 3. Config file (if provided)
    /// 4. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SFU")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_flat_env();
        Ok(config)
    }

    fn apply_flat_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(servers) = std::env::var("STUN_SERVERS") {
            let list: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !list.is_empty() {
                self.webrtc.stun_servers = list;
            }
        }
        if let Ok(debug) = std::env::var("DEBUG") {
            self.logging.level = if debug.parse().unwrap_or(true) {
                "debug".to_string()
            } else {
                "info".to_string()
            };
        }
        if let Ok(verbose) = std::env::var("VERBOSE_LOG") {
            self.logging.verbose_rtp = verbose.parse().unwrap_or(false);
        }
    }

    /// Get the HTTP listen address.
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
