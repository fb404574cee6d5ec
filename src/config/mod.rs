use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

/// Knobs for the stream session data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Pre-buffer window in seconds; 0 disables pre-buffering and the
    /// rolling buffer. May be overridden per-session by the catalog
    /// `proxy_buffer_seconds` setting.
    pub pre_buffer_seconds: u64,
    /// Cumulative reconnect attempts allowed over a session lifetime.
    pub max_reconnects: u32,
    /// Delay before a reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// A single upstream chunk read must complete within this window.
    pub stall_timeout_ms: u64,
    /// Outer timeout on the first-byte milestone during variant failover.
    pub start_timeout_ms: u64,
    /// How long an empty VOD session lingers before self-destructing.
    pub vod_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./iptv-gateway.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                base_url: "http://localhost:8080".to_string(),
            },
            streaming: StreamingConfig::default(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            pre_buffer_seconds: 3,
            max_reconnects: 5,
            reconnect_delay_ms: 2000,
            stall_timeout_ms: 30_000,
            start_timeout_ms: 8_000,
            vod_grace_ms: 500,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let mut config: Config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over the config file.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("PROXY_BUFFER_SECONDS") {
            self.streaming.pre_buffer_seconds = v;
        }
        if let Some(v) = env_u64("STREAM_MAX_RECONNECTS") {
            self.streaming.max_reconnects = v as u32;
        }
        if let Some(v) = env_u64("STREAM_RECONNECT_DELAY") {
            self.streaming.reconnect_delay_ms = v;
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
