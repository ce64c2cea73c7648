use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::DEFAULT_RECONNECT_DELAY;

// Layered from struct defaults, then gateway.toml, then GATEWAY_* env vars:
//
//   gateway.toml:    [upstream]
//                    reconnect_delay_ms = 2000
//
//   env var:         GATEWAY_UPSTREAM__RECONNECT_DELAY_MS=2000

/// Everything tunable about the gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Listener and transport knobs (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory served at `/` next to the websocket endpoint
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    /// Outbound frames buffered per connection before new ones are dropped
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Upstream stream knobs (`[upstream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_send_channel_capacity() -> usize {
    256
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY.as_millis() as u64
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

impl UpstreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Build the figment for `config_file` (missing files are skipped).
pub fn load_config(config_file: Option<&Path>) -> Figment {
    let figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
    let figment = match config_file {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment,
    };
    figment.merge(Env::prefixed("GATEWAY_").split("__"))
}

/// Load and extract the configuration.
pub fn resolve(config_file: Option<&Path>) -> Result<GatewayConfig> {
    load_config(config_file)
        .extract()
        .context("Failed to load gateway configuration")
}
