//! Upstream live-room connections.
//!
//! The [`UpstreamFactory`] trait is the seam between the room connection pool
//! and the platform protocol; [`BilibiliFactory`] is the production
//! implementation with WebSocket and raw-TCP transports.

pub mod bilibili;
pub mod connection;
pub mod factory;
pub mod packet;

pub use bilibili::BilibiliFactory;
pub use connection::{ConnectionHandle, RoomConnection, RoomEvent};
pub use factory::{TransportMode, UpstreamFactory};
