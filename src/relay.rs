//! Relay orchestrator.
//!
//! Wires subscriber join/leave events from the downstream transport to the
//! room connection pool, and the pool's normalized output to the broadcast
//! channel downstream sessions subscribe to.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::danmaku::Danmaku;
use crate::pool::RoomConnectionPool;
use crate::upstream::UpstreamFactory;

/// Capacity of the downstream danmaku broadcast channel.
const DANMAKU_BROADCAST_CAPACITY: usize = 1024;

/// Connects the subscriber transport to the room connection pool.
pub struct Relay {
    pool: Arc<RoomConnectionPool>,
    danmaku_tx: broadcast::Sender<Danmaku>,
}

impl Relay {
    /// Create a relay whose pool builds connections with the given factory.
    pub fn new(factory: Arc<dyn UpstreamFactory>) -> Self {
        let (danmaku_tx, _) = broadcast::channel(DANMAKU_BROADCAST_CAPACITY);
        let pool = Arc::new(RoomConnectionPool::new(factory, danmaku_tx.clone()));
        Self { pool, danmaku_tx }
    }

    /// The pool handle, shared with the reconnect scheduler.
    pub fn pool(&self) -> Arc<RoomConnectionPool> {
        Arc::clone(&self.pool)
    }

    /// A downstream subscriber started watching a room.
    pub async fn on_subscriber_join(&self, room_id: u64) {
        debug!("Subscriber joined room {}", room_id);
        self.pool.join(room_id).await;
    }

    /// A downstream subscriber stopped watching a room.
    pub async fn on_subscriber_leave(&self, room_id: u64) {
        debug!("Subscriber left room {}", room_id);
        self.pool.leave(room_id).await;
    }

    /// Subscribe to the normalized danmaku stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Danmaku> {
        self.danmaku_tx.subscribe()
    }

    /// Whether a room currently has a live upstream connection.
    pub async fn is_connected(&self, room_id: u64) -> bool {
        self.pool.is_connected(room_id).await
    }

    /// Close all upstream connections.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::upstream::{RoomConnection, RoomEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct StaticFactory {
        senders: Mutex<Vec<mpsc::Sender<RoomEvent>>>,
    }

    impl StaticFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UpstreamFactory for StaticFactory {
        async fn create(&self, room_id: u64) -> Result<RoomConnection> {
            let (mut connection, parts) = RoomConnection::new(room_id);
            parts.live.store(true, Ordering::SeqCst);
            self.senders.lock().unwrap().push(parts.events_tx.clone());
            let shutdown = parts.shutdown.clone();
            connection.attach_task(tokio::spawn(async move {
                let _events_tx = parts.events_tx;
                shutdown.cancelled().await;
            }));
            Ok(connection)
        }
    }

    #[tokio::test]
    async fn test_relay_join_subscribe_leave() {
        let factory = StaticFactory::new();
        let relay = Relay::new(Arc::clone(&factory) as Arc<dyn UpstreamFactory>);

        let mut rx = relay.subscribe();
        relay.on_subscriber_join(7).await;
        assert!(relay.is_connected(7).await);

        let sender = factory.senders.lock().unwrap().last().cloned().unwrap();
        sender
            .send(RoomEvent::Danmu(json!({
                "cmd": "DANMU_MSG",
                "info": [[], "hi", [42, "alice"], [], [], "", 0, {}, null, { "ts": 1000 }]
            })))
            .await
            .unwrap();

        let danmaku = rx.recv().await.unwrap();
        assert_eq!(danmaku.room_id, 7);
        assert_eq!(danmaku.text, "hi");

        relay.on_subscriber_leave(7).await;
        assert!(!relay.is_connected(7).await);
    }
}
