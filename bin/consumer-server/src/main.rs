//! Consumer Engine server.
//!
//! Consumes messages from a single AMQP 0-9-1 queue set and dispatches each
//! to a configured webhook, with deduplication, business-hours gating,
//! pause/resume, and state persisted across restarts. Exposes a small HTTP
//! control API for managing which queues are consumed.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use consumer_broker::{RabbitMqBroker, RabbitMqConfig};
use consumer_config::ConfigLoader;
use consumer_engine::api::{router, AppState};
use consumer_engine::dedup::DedupConfig;
use consumer_engine::engine::ConsumerEngine;
use consumer_engine::reconnect::ReconnectConfig;
use consumer_engine::webhook::{WebhookSender, WebhookSenderConfig};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const HARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    consumer_common::logging::init_logging("consumer-engine");

    let config = ConfigLoader::new().load()?;
    info!(port = config.http.port, broker = %config.broker.url, "starting consumer-engine");

    let timezone: chrono_tz::Tz = config
        .business_hours_timezone
        .parse()
        .unwrap_or_else(|_| {
            warn!(tz = config.business_hours_timezone, "unrecognised timezone, defaulting to UTC");
            chrono_tz::UTC
        });

    let broker = RabbitMqBroker::new(RabbitMqConfig::new(config.broker.url.clone()));

    let dedup_config = DedupConfig {
        max_processed: config.dedup.max_processed,
        cleanup_interval: Duration::from_millis(config.dedup.cleanup_interval_ms),
        stale: Duration::from_millis(config.dedup.stale_ms),
    };

    let webhook_config = WebhookSenderConfig {
        timeout: Duration::from_millis(config.webhook.timeout_ms),
        probe_timeout: Duration::from_millis(config.webhook.probe_timeout_ms),
        max_attempts: config.webhook.max_attempts,
        retry_base_delay: Duration::from_millis(config.webhook.retry_base_delay_ms),
    };

    let reconnect_config = ReconnectConfig {
        base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
        max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
        cooldown: Duration::from_millis(config.reconnect.debounce_ms),
        max_attempts: Some(config.reconnect.max_attempts),
    };

    let engine = ConsumerEngine::new(
        broker,
        dedup_config,
        webhook_config.clone(),
        reconnect_config,
        config.persistence.path.clone(),
        timezone,
    );

    engine.initialize().await?;

    let restore_report = engine.restore_persisted().await?;
    info!(
        restored = restore_report.restored,
        failed = restore_report.failed,
        skipped = restore_report.skipped,
        removed = restore_report.removed,
        "restored persisted queue configurations"
    );

    let webhook = Arc::new(WebhookSender::new(webhook_config));

    let health_monitor_config = consumer_engine::queue_health_monitor::QueueHealthMonitorConfig {
        interval: Duration::from_secs(config.health_monitor.check_interval_secs),
    };
    let (monitor_shutdown_tx, monitor_shutdown_rx) = tokio::sync::broadcast::channel(1);
    let monitor_handle = consumer_engine::queue_health_monitor::spawn(
        Arc::clone(&engine),
        Arc::clone(engine.reconnection_controller()),
        health_monitor_config,
        monitor_shutdown_rx,
    );

    let app: Router = router(AppState {
        engine: Arc::clone(&engine),
        webhook,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "control API listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server terminated unexpectedly");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = monitor_shutdown_tx.send(());
    monitor_handle.abort();
    server_task.abort();

    match tokio::time::timeout(HARD_SHUTDOWN_TIMEOUT, engine.shutdown()).await {
        Ok(()) => info!("consumer-engine shut down cleanly"),
        Err(_) => {
            warn!("shutdown did not complete within {:?}, exiting anyway", HARD_SHUTDOWN_TIMEOUT);
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
