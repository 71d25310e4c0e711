//! danmaku-relay: relay live chat (danmaku) from Bilibili live rooms to
//! downstream WebSocket subscribers.
//!
//! ## Architecture
//!
//! - [`pool::RoomConnectionPool`] — one upstream connection per distinct
//!   room, shared across subscribers via reference counting; the only place
//!   connections are created or destroyed.
//! - [`upstream`] — the connection factory seam and the Bilibili WebSocket /
//!   raw-TCP transports behind it.
//! - [`danmaku`] — the canonical message shape and the normalizer that
//!   produces it from raw upstream payloads.
//! - [`scheduler::ReconnectScheduler`] — cron-driven staggered reconnection
//!   of every open connection.
//! - [`relay::Relay`] — wires subscriber join/leave to the pool and
//!   normalized messages to the downstream broadcast channel.
//! - [`server`] — the subscriber-facing WebSocket endpoint.

pub mod config;
pub mod danmaku;
pub mod error;
pub mod pool;
pub mod relay;
pub mod scheduler;
pub mod server;
pub mod upstream;

pub use config::AppConfig;
pub use danmaku::{Danmaku, Sender};
pub use error::{Error, Result};
pub use pool::RoomConnectionPool;
pub use relay::Relay;
pub use scheduler::ReconnectScheduler;
pub use upstream::{BilibiliFactory, TransportMode, UpstreamFactory};
