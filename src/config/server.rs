//! Server configuration
//!
//! Loads server settings from a TOML file. A missing file yields defaults so the
//! binary runs without any setup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "sketchroom.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Deadline for enqueueing one frame to one recipient
    pub send_timeout_ms: u64,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// Length of generated room codes
    pub room_code_length: usize,
    /// Serve the single global lobby on `/ws`
    pub lobby: bool,
    /// Inbound frames larger than this are dropped
    pub max_frame_bytes: usize,
    /// How long a created room may wait for its first member
    pub unjoined_room_ttl_ms: u64,
    /// How often unjoined rooms are swept
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
            send_timeout_ms: 2000,
            outbound_queue: 256,
            room_code_length: 6,
            lobby: true,
            max_frame_bytes: 64 * 1024,
            unjoined_room_ttl_ms: 10 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults if it is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override the bind address
    pub fn with_bind(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        self
    }

    /// Override the port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Per-recipient delivery deadline
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn unjoined_room_ttl(&self) -> Duration {
        Duration::from_millis(self.unjoined_room_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
