use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use danmaku_relay::server::{self, AppState};
use danmaku_relay::{AppConfig, BilibiliFactory, Relay, ReconnectScheduler, UpstreamFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "danmaku_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DANMAKU_RELAY_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    let factory: Arc<dyn UpstreamFactory> =
        Arc::new(BilibiliFactory::new(config.transport_mode()));
    let relay = Arc::new(Relay::new(factory));

    let cancel = CancellationToken::new();

    let scheduler_task = match &config.reconnect_cron {
        Some(expression) => {
            info!("Reconnect task schedule at {:?}", expression);
            let scheduler =
                ReconnectScheduler::new(expression, config.timezone.as_deref(), relay.pool())
                    .context("invalid reconnect schedule")?;
            Some(scheduler.spawn(cancel.clone()))
        }
        None => None,
    };

    // Translate ctrl-c into cancellation for the server and scheduler.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    let state = AppState {
        relay: Arc::clone(&relay),
        basic_auth: config.basic_auth.clone(),
    };
    let addr = format!("{}:{}", config.hostname, config.port);
    server::serve(state, &addr, cancel.clone()).await?;

    cancel.cancel();
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    relay.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
