//! Server configuration
//!
//! Loaded from an optional JSON file, then overridden by CLI flags in the
//! server binary. Every field has a default, so `{}` is a valid file.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 32001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// TCP port (0 = pick any free port)
    pub port: u16,
    /// Model file handed to the backend loader
    pub model_path: PathBuf,
    /// Per-connection socket read timeout
    pub read_timeout_ms: u64,
    /// Per-connection socket write timeout
    pub write_timeout_ms: u64,
    /// How long a handler waits for the backend gate
    pub gate_timeout_ms: u64,
    /// Collect request metrics
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            model_path: PathBuf::from("mnist.mnlm"),
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            gate_timeout_ms: 10_000,
            metrics: true,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ServerError::Config("host must not be empty".to_string()));
        }
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("gate_timeout_ms", self.gate_timeout_ms),
        ] {
            if value == 0 {
                return Err(ServerError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ServerError::Config(format!("{}:{} did not resolve", self.host, self.port))
            })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }
}
