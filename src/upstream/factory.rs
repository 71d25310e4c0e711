//! Upstream connection factory trait and transport mode selection.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::upstream::connection::RoomConnection;

/// Which underlying protocol is used to reach the upstream room.
///
/// Fixed for the process lifetime, configured at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Stream-oriented WebSocket transport
    WebSocket,
    /// Raw TCP socket transport
    Tcp,
}

impl Default for TransportMode {
    fn default() -> Self {
        Self::WebSocket
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "ws"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Ok(Self::WebSocket),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

/// Creates upstream connections bound to a single room.
///
/// The only place connections are built; the pool owns every handle the
/// factory returns.
#[async_trait]
pub trait UpstreamFactory: Send + Sync + 'static {
    /// Establish a connection to the given room.
    ///
    /// Fails with [`crate::error::Error::ConnectionCreation`] when the
    /// transport cannot be established. Later failures surface as
    /// [`crate::upstream::RoomEvent::Error`] events on the returned handle.
    async fn create(&self, room_id: u64) -> Result<RoomConnection>;
}
