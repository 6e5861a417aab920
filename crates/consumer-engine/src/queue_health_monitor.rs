//! Queue Health Monitor: periodically passively checks each actively
//! consumed queue still exists, proactively signalling reconnection need
//! without itself being a second reconnection loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::ConsumerEngine;
use crate::reconnect::ReconnectionController;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

pub struct QueueHealthMonitorConfig {
    pub interval: Duration,
}

impl Default for QueueHealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Spawns the periodic sweep task. Returns a handle the caller can abort on
/// shutdown; the task also exits on its own once `shutdown` fires.
pub fn spawn(
    engine: Arc<ConsumerEngine>,
    reconnection: Arc<ReconnectionController>,
    config: QueueHealthMonitorConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    sweep(&engine, &reconnection).await;
                }
            }
        }
    })
}

async fn sweep(engine: &Arc<ConsumerEngine>, reconnection: &Arc<ReconnectionController>) {
    if !engine.is_broker_ready().await {
        warn!("queue health monitor: channel not ready, requesting reconnection");
        reconnection.schedule_reconnect();
        return;
    }

    for queue in engine.active_queues().await {
        match engine.check_queue_exists(&queue.queue).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = engine.handle_external_deletion(&queue.queue).await {
                    warn!(queue = queue.queue, error = %e, "failed to stop consumer for deleted queue");
                }
            }
            Err(e) => {
                if e.is_reconnect_worthy() {
                    warn!(queue = queue.queue, error = %e, "connection-level error during health sweep, aborting");
                    reconnection.schedule_reconnect();
                    return;
                }
                info!(queue = queue.queue, error = %e, "transient error checking queue, continuing sweep");
            }
        }
    }
}
