//! Room connection pool.
//!
//! The only place upstream connections are created or destroyed. One
//! connection exists per distinct room, shared across subscribers via
//! reference counting. Each connection feeds a dispatch task that normalizes
//! raw payloads and forwards them to the downstream broadcast sink, so event
//! order within a room is preserved while rooms interleave freely.
//!
//! Operations on the same room are serialized through a per-room mutex;
//! operations on different rooms proceed concurrently. No lifecycle error
//! ever propagates to callers — failures are logged where they occur and the
//! pool's bookkeeping stays consistent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::danmaku::{Danmaku, normalize};
use crate::error::{Error, Result};
use crate::upstream::{ConnectionHandle, RoomEvent, UpstreamFactory};

/// Bound on connection creation and close. Expiry counts as failure so a
/// hung transport cannot stall a room's subsequent operations forever.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A pooled connection with its subscriber refcount.
struct RoomEntry {
    connection: ConnectionHandle,
    dispatch: JoinHandle<()>,
    subscribers: u32,
}

/// Per-room slot serializing all lifecycle operations for one room id.
///
/// `detached` marks a slot that has been removed from the map while another
/// task was waiting on its mutex; such waiters retry against a fresh slot.
#[derive(Default)]
struct RoomSlot {
    entry: Option<RoomEntry>,
    detached: bool,
}

/// Maps room id to its shared upstream connection.
pub struct RoomConnectionPool {
    factory: Arc<dyn UpstreamFactory>,
    rooms: DashMap<u64, Arc<Mutex<RoomSlot>>>,
    sink: broadcast::Sender<Danmaku>,
    lifecycle_timeout: Duration,
}

impl RoomConnectionPool {
    /// Create a pool that forwards normalized danmaku into `sink`.
    pub fn new(factory: Arc<dyn UpstreamFactory>, sink: broadcast::Sender<Danmaku>) -> Self {
        Self {
            factory,
            rooms: DashMap::new(),
            sink,
            lifecycle_timeout: LIFECYCLE_TIMEOUT,
        }
    }

    /// Register a subscriber for a room, opening the upstream connection on
    /// first join.
    ///
    /// Creation failures are logged and leave no entry behind; a later join
    /// may retry.
    pub async fn join(&self, room_id: u64) {
        loop {
            let slot = self.slot(room_id);
            let mut guard = slot.lock().await;
            if guard.detached {
                // Slot was torn down while we waited; take a fresh one.
                continue;
            }

            if let Some(entry) = guard.entry.as_mut() {
                entry.subscribers += 1;
                debug!(
                    "Room {} now has {} subscribers",
                    room_id, entry.subscribers
                );
                return;
            }

            match self.open_entry(room_id).await {
                Ok(entry) => {
                    debug!("Opened connection to room {}", room_id);
                    guard.entry = Some(entry);
                }
                Err(e) => {
                    error!("Failed to open connection to room {}: {}", room_id, e);
                    guard.detached = true;
                    self.rooms.remove(&room_id);
                }
            }
            return;
        }
    }

    /// Drop a subscriber for a room, closing the upstream connection when the
    /// last one leaves. No-op for rooms without an entry.
    pub async fn leave(&self, room_id: u64) {
        let Some(slot) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let mut guard = slot.lock().await;

        let subscribers = match guard.entry.as_ref() {
            None => return,
            Some(entry) => entry.subscribers,
        };

        if subscribers > 1 {
            if let Some(entry) = guard.entry.as_mut() {
                entry.subscribers -= 1;
                debug!(
                    "Room {} now has {} subscribers",
                    room_id, entry.subscribers
                );
            }
            return;
        }

        debug!("Room {} is no longer used, closing", room_id);
        if let Some(entry) = guard.entry.take() {
            self.close_entry(room_id, entry).await;
        }
        guard.detached = true;
        self.rooms.remove(&room_id);
    }

    /// Replace a room's connection with a freshly created one, preserving the
    /// subscriber count. No-op for rooms without an entry.
    ///
    /// If the replacement cannot be created the entry is removed rather than
    /// left holding a dead handle; the next join re-opens the room.
    pub async fn reconnect(&self, room_id: u64) {
        let Some(slot) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
            return;
        };
        let mut guard = slot.lock().await;
        let Some(old) = guard.entry.take() else {
            return;
        };
        let subscribers = old.subscribers;
        self.close_entry(room_id, old).await;

        match self.open_entry(room_id).await {
            Ok(mut entry) => {
                debug!("Reconnected room {}", room_id);
                entry.subscribers = subscribers;
                guard.entry = Some(entry);
            }
            Err(e) => {
                error!(
                    "Failed to reopen connection to room {}: {}; removing entry",
                    room_id, e
                );
                guard.detached = true;
                self.rooms.remove(&room_id);
            }
        }
    }

    /// Whether a room has an entry whose connection completed its handshake.
    pub async fn is_connected(&self, room_id: u64) -> bool {
        let Some(slot) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        let guard = slot.lock().await;
        guard
            .entry
            .as_ref()
            .is_some_and(|e| e.connection.is_live())
    }

    /// Current subscriber count for a room (0 without an entry).
    pub async fn subscriber_count(&self, room_id: u64) -> u32 {
        let Some(slot) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
            return 0;
        };
        let guard = slot.lock().await;
        guard.entry.as_ref().map_or(0, |e| e.subscribers)
    }

    /// Snapshot of currently-open room ids.
    pub fn rooms(&self) -> Vec<u64> {
        self.rooms.iter().map(|r| *r.key()).collect()
    }

    /// Close every open connection. Used at process shutdown.
    pub async fn shutdown(&self) {
        for room_id in self.rooms() {
            let Some(slot) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.entry.take() {
                self.close_entry(room_id, entry).await;
            }
            guard.detached = true;
            self.rooms.remove(&room_id);
        }
    }

    /// Fetch or insert the slot for a room id.
    fn slot(&self, room_id: u64) -> Arc<Mutex<RoomSlot>> {
        Arc::clone(
            self.rooms
                .entry(room_id)
                .or_insert_with(|| Arc::new(Mutex::new(RoomSlot::default())))
                .value(),
        )
    }

    /// Create a connection and its dispatch task. Callers hold the room slot
    /// lock.
    async fn open_entry(&self, room_id: u64) -> Result<RoomEntry> {
        let connection = tokio::time::timeout(self.lifecycle_timeout, self.factory.create(room_id))
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "creation timed out after {:?}",
                    self.lifecycle_timeout
                ))
            })??;

        let (handle, events) = connection.split();
        let dispatch = tokio::spawn(dispatch_events(room_id, events, self.sink.clone()));

        Ok(RoomEntry {
            connection: handle,
            dispatch,
            subscribers: 1,
        })
    }

    /// Best-effort close. Errors and timeouts are logged, never propagated.
    async fn close_entry(&self, room_id: u64, entry: RoomEntry) {
        let RoomEntry {
            connection,
            dispatch,
            ..
        } = entry;

        match tokio::time::timeout(self.lifecycle_timeout, connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error closing connection to room {}: {}", room_id, e),
            Err(_) => error!(
                "Timed out closing connection to room {} after {:?}",
                room_id, self.lifecycle_timeout
            ),
        }

        // The dispatch loop ends once the event channel closes; abort covers
        // the timeout path where the I/O tasks were only dropped.
        dispatch.abort();
    }
}

/// Per-connection normalization-and-dispatch loop.
///
/// Malformed payloads are dropped with a warning; upstream error signals are
/// logged and the connection is left as-is — reconnection happens only on an
/// explicit [`RoomConnectionPool::reconnect`].
async fn dispatch_events(
    room_id: u64,
    mut events: mpsc::Receiver<RoomEvent>,
    sink: broadcast::Sender<Danmaku>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Live => {
                debug!("Connected to live room: {}", room_id);
            }
            RoomEvent::Danmu(raw) => match normalize(room_id, &raw) {
                Ok(danmaku) => {
                    // Send fails only when no subscriber is listening.
                    let _ = sink.send(danmaku);
                }
                Err(e) => {
                    warn!("Dropping malformed danmaku for room {}: {}", room_id, e);
                }
            },
            RoomEvent::Error(e) => {
                error!("Room {} upstream error: {}", room_id, e);
            }
        }
    }
}
