//! Connection handle types shared by all upstream transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Capacity of the per-connection event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by an upstream connection over its lifetime.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The connection completed its handshake with the remote room.
    Live,
    /// A raw chat notification payload.
    Danmu(Value),
    /// A non-fatal transport or protocol error.
    Error(String),
}

/// Pieces handed to the transport implementation when a connection is built.
///
/// The transport's I/O tasks push events through `events_tx`, flip `live`
/// once the handshake completes, and exit when `shutdown` is cancelled.
pub struct ConnectionParts {
    pub events_tx: mpsc::Sender<RoomEvent>,
    pub live: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

/// An owned upstream connection bound to a single room.
///
/// Created by an [`crate::upstream::UpstreamFactory`]; split by the pool into
/// a [`ConnectionHandle`] plus the event receiver that feeds the dispatch
/// loop.
pub struct RoomConnection {
    room_id: u64,
    live: Arc<AtomicBool>,
    events: mpsc::Receiver<RoomEvent>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomConnection {
    /// Create a connection shell and the parts the transport tasks need.
    pub fn new(room_id: u64) -> (Self, ConnectionParts) {
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let live = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let parts = ConnectionParts {
            events_tx,
            live: Arc::clone(&live),
            shutdown: shutdown.clone(),
        };

        let connection = Self {
            room_id,
            live,
            events,
            shutdown,
            tasks: Vec::new(),
        };

        (connection, parts)
    }

    /// Register an I/O task owned by this connection.
    ///
    /// Registered tasks are cancelled and awaited on close.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    /// Whether the handshake with the remote room has completed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Split into the control handle and the event receiver.
    pub fn split(self) -> (ConnectionHandle, mpsc::Receiver<RoomEvent>) {
        let handle = ConnectionHandle {
            room_id: self.room_id,
            live: self.live,
            shutdown: self.shutdown,
            tasks: self.tasks,
        };
        (handle, self.events)
    }
}

/// Control half of a [`RoomConnection`] retained by the pool.
pub struct ConnectionHandle {
    room_id: u64,
    live: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    /// Whether the handshake with the remote room has completed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Tear down the connection.
    ///
    /// Signals the I/O tasks to stop and waits for them to finish. A task
    /// that panicked surfaces as [`Error::Close`].
    pub async fn close(mut self) -> Result<()> {
        self.live.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let mut first_error = None;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && !e.is_cancelled()
                && first_error.is_none()
            {
                first_error = Some(Error::close(e.to_string()));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // Ensure tasks do not outlive an abandoned handle.
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_live_flag() {
        let (connection, parts) = RoomConnection::new(7);

        assert_eq!(connection.room_id(), 7);
        assert!(!connection.is_live());

        parts.live.store(true, Ordering::SeqCst);
        assert!(connection.is_live());
    }

    #[tokio::test]
    async fn test_split_preserves_events() {
        let (connection, parts) = RoomConnection::new(7);
        parts
            .events_tx
            .send(RoomEvent::Live)
            .await
            .expect("channel open");

        let (handle, mut events) = connection.split();
        assert!(matches!(events.recv().await, Some(RoomEvent::Live)));
        assert_eq!(handle.room_id(), 7);

        handle.close().await.expect("close ok");
    }

    #[tokio::test]
    async fn test_close_cancels_tasks() {
        let (mut connection, parts) = RoomConnection::new(7);
        let shutdown = parts.shutdown.clone();
        connection.attach_task(tokio::spawn(async move {
            shutdown.cancelled().await;
        }));

        let (handle, _events) = connection.split();
        handle.close().await.expect("close ok");
    }
}
