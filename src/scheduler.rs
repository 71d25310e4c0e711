//! Scheduled staggered reconnection of pooled room connections.
//!
//! Fires on a cron schedule; each cycle takes a snapshot of the open rooms
//! and reconnects them one at a time with a fixed delay in between, so a
//! large pool never hammers the remote service with simultaneous connection
//! attempts. Rooms opened after the snapshot are untouched by that cycle.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::RoomConnectionPool;

/// Delay between two rooms' reconnects within one batch.
const BATCH_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Periodic batch-reconnect task driver.
pub struct ReconnectScheduler {
    schedule: Schedule,
    timezone: Tz,
    pool: Arc<RoomConnectionPool>,
    delay: Duration,
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("schedule", &self.schedule)
            .field("timezone", &self.timezone)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl ReconnectScheduler {
    /// Build a scheduler from a cron expression and optional IANA timezone.
    ///
    /// Classic five-field expressions are accepted alongside the
    /// seconds-prefixed form.
    pub fn new(
        expression: &str,
        timezone: Option<&str>,
        pool: Arc<RoomConnectionPool>,
    ) -> Result<Self> {
        let schedule = parse_schedule(expression)?;
        let timezone: Tz = match timezone {
            Some(tz_str) => tz_str.parse().map_err(|_| {
                Error::config(format!("'{tz_str}' is not a valid IANA timezone"))
            })?,
            None => chrono_tz::UTC,
        };

        Ok(Self {
            schedule,
            timezone,
            pool,
            delay: BATCH_RECONNECT_DELAY,
        })
    }

    /// Run the scheduler until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Reconnect task schedule: \"{}\"", self.schedule);
            self.run(cancel).await;
        })
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            let now = Utc::now().with_timezone(&self.timezone);
            let Some(next) = self.schedule.upcoming(self.timezone).next() else {
                warn!("Cron schedule has no upcoming fire times, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    self.run_batch(&cancel).await;
                }
            }
        }
    }

    /// Reconnect every room in a snapshot taken at the start of the batch,
    /// pacing the attempts with the inter-room delay.
    ///
    /// Cancellation is honored between rooms; a room's in-flight reconnect is
    /// never interrupted.
    pub async fn run_batch(&self, cancel: &CancellationToken) {
        debug!("Start batch reconnect task");
        let mut snapshot = self.pool.rooms();
        snapshot.sort_unstable();

        for room_id in snapshot {
            self.pool.reconnect(room_id).await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

/// Parse a cron expression, accepting the classic five-field form by
/// prepending a zero seconds field.
fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::config(format!("invalid cron expression {expression:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danmaku::Danmaku;
    use crate::upstream::{RoomConnection, UpstreamFactory};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    /// Factory recording when each connection was created, under the tokio
    /// test clock.
    struct TimingFactory {
        creates: Mutex<Vec<(u64, Instant)>>,
    }

    impl TimingFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creates: Mutex::new(Vec::new()),
            })
        }

        fn creates(&self) -> Vec<(u64, Instant)> {
            self.creates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamFactory for TimingFactory {
        async fn create(&self, room_id: u64) -> crate::error::Result<RoomConnection> {
            self.creates.lock().unwrap().push((room_id, Instant::now()));
            let (mut connection, parts) = RoomConnection::new(room_id);
            parts.live.store(true, Ordering::SeqCst);
            let shutdown = parts.shutdown.clone();
            connection.attach_task(tokio::spawn(async move {
                let _events_tx = parts.events_tx;
                shutdown.cancelled().await;
            }));
            Ok(connection)
        }
    }

    fn scheduler_with_pool() -> (ReconnectScheduler, Arc<RoomConnectionPool>, Arc<TimingFactory>) {
        let factory = TimingFactory::new();
        let (tx, _rx) = broadcast::channel::<Danmaku>(16);
        let pool = Arc::new(RoomConnectionPool::new(
            Arc::clone(&factory) as Arc<dyn UpstreamFactory>,
            tx,
        ));
        let scheduler =
            ReconnectScheduler::new("0 * * * * *", None, Arc::clone(&pool)).unwrap();
        (scheduler, pool, factory)
    }

    #[test]
    fn test_parse_five_field_expression() {
        assert!(parse_schedule("*/30 * * * *").is_ok());
        assert!(parse_schedule("0 */30 * * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let factory = TimingFactory::new();
        let (tx, _rx) = broadcast::channel::<Danmaku>(16);
        let pool = Arc::new(RoomConnectionPool::new(
            factory as Arc<dyn UpstreamFactory>,
            tx,
        ));
        let err = ReconnectScheduler::new("* * * * *", Some("Not/AZone"), pool).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_reconnects_in_order_with_delay() {
        let (scheduler, pool, factory) = scheduler_with_pool();

        pool.join(1).await;
        pool.join(2).await;
        pool.join(3).await;
        let initial = factory.creates().len();
        assert_eq!(initial, 3);

        scheduler.run_batch(&CancellationToken::new()).await;

        let creates = factory.creates();
        let reconnects: Vec<_> = creates[initial..].to_vec();
        assert_eq!(
            reconnects.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // Consecutive reconnects are paced by the inter-room delay.
        for pair in reconnects.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_excludes_rooms_opened_after_snapshot() {
        let (scheduler, pool, factory) = scheduler_with_pool();

        pool.join(1).await;
        pool.join(2).await;

        let pool_clone = Arc::clone(&pool);
        let batch = tokio::spawn(async move {
            scheduler.run_batch(&CancellationToken::new()).await;
        });

        // Let the batch take its snapshot and start working.
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool_clone.join(99).await;

        batch.await.unwrap();

        let creates_for_99 = factory
            .creates()
            .iter()
            .filter(|(id, _)| *id == 99)
            .count();
        assert_eq!(creates_for_99, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cancellation_stops_between_rooms() {
        let (scheduler, pool, factory) = scheduler_with_pool();

        pool.join(1).await;
        pool.join(2).await;
        let initial = factory.creates().len();

        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run_batch(&cancel).await;

        // The first room's reconnect runs; cancellation is observed before
        // the second.
        assert_eq!(factory.creates().len(), initial + 1);
    }
}
