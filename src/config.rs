//! Process configuration.
//!
//! Loaded once at startup from a JSON file (the original deployment shape);
//! malformed or missing required configuration is startup-fatal.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::upstream::TransportMode;

/// Startup configuration for the relay process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Bind address for the subscriber-facing listener
    pub hostname: String,
    /// Bind port for the subscriber-facing listener
    pub port: u16,
    /// Shared token subscribers must present; None disables auth
    #[serde(default)]
    pub basic_auth: Option<String>,
    /// Upstream transport selection ("ws" or "tcp")
    #[serde(default, alias = "bilibiliProtocol")]
    pub transport: Option<String>,
    /// Cron expression for the periodic reconnect task; None disables it
    #[serde(default)]
    pub reconnect_cron: Option<String>,
    /// IANA timezone the cron expression is evaluated in (default UTC)
    #[serde(default)]
    pub timezone: Option<String>,
}

impl AppConfig {
    /// Load and parse the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            Error::config(format!("failed to parse {}: {e}", path.display()))
        })?;

        if config.hostname.trim().is_empty() {
            return Err(Error::config("hostname must not be empty"));
        }

        Ok(config)
    }

    /// Resolve the configured transport mode.
    ///
    /// An absent or unrecognized value falls back to the WebSocket transport,
    /// matching the historical default.
    pub fn transport_mode(&self) -> TransportMode {
        match self.transport.as_deref() {
            None => {
                info!("Transport mode not specified, defaulting to ws");
                TransportMode::default()
            }
            Some(value) => match TransportMode::from_str(value) {
                Ok(mode) => mode,
                Err(e) => {
                    warn!("{e}, defaulting to ws");
                    TransportMode::default()
                }
            },
        }
    }
}
