//! Ambient health checks exposed over `/health`, `/health/live` and
//! `/health/ready`, distinct from the queue health monitor's active sweep.

use std::sync::Arc;

use serde::Serialize;

use crate::engine::ConsumerEngine;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub broker_connected: bool,
    pub active_queues: usize,
}

/// Liveness: the process is up and able to respond. Never reports unhealthy
/// on its own; a stuck process simply stops answering requests.
pub fn liveness() -> HealthStatus {
    HealthStatus {
        healthy: true,
        broker_connected: false,
        active_queues: 0,
    }
}

/// Readiness: the broker channel is connected. An engine that lost its
/// channel and hasn't reconnected yet should be taken out of rotation.
pub async fn readiness(engine: &Arc<ConsumerEngine>) -> HealthStatus {
    let broker_connected = engine.is_broker_ready().await;
    let active_queues = engine.stats().active_queues;
    HealthStatus {
        healthy: broker_connected,
        broker_connected,
        active_queues,
    }
}
