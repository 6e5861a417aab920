//! Consumer Engine (C7): orchestrates per-queue consumption, owning the
//! broker, dedup store, webhook sender, reconnection controller and
//! persistence store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use consumer_broker::{BrokerClient, BrokerError};
use consumer_common::{validate_and_sanitise, BusinessHours, ConsumerConfig};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dedup::{DedupConfig, DedupStore};
use crate::error::EngineError;
use crate::persistence::{PersistedQueueEntry, PersistenceStats, PersistenceStore};
use crate::processor::MessageProcessor;
use crate::reconnect::{ReconnectConfig, ReconnectionController};
use crate::webhook::{WebhookSender, WebhookSenderConfig};

type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Starting,
    Running,
    Paused,
    Reestablishing,
    Stopping,
}

struct QueueHandle {
    state: RwLock<QueueState>,
    config: Arc<RwLock<ConsumerConfig>>,
    task: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub queue: String,
    pub state: String,
    pub webhook_url: String,
    pub paused: bool,
    pub message_count: u64,
    pub consumer_count: u32,
    pub is_active: bool,
    pub estimated_completion_ms: Option<u64>,
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub active_queues: usize,
    pub dedup_processed: usize,
    pub dedup_in_flight: usize,
    pub processor_processed: u64,
    pub processor_failed: u64,
    pub processor_duplicates: u64,
    pub processor_skipped: u64,
    pub webhook_sent: u64,
    pub webhook_failed: u64,
    pub webhook_retries: u64,
    pub webhook_avg_response_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
    pub skipped: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistedQueuesReport {
    pub persisted: Vec<PersistedQueueEntry>,
    pub stats: PersistenceStats,
}

/// Arguments accepted by `start_consuming`, mirroring the public control API
/// request body.
#[derive(Debug, Clone)]
pub struct StartConsumingRequest {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
}

pub struct ConsumerEngine {
    broker: Arc<dyn BrokerClient>,
    dedup: Arc<DedupStore>,
    webhook: Arc<WebhookSender>,
    persistence: Arc<PersistenceStore>,
    reconnection: Arc<ReconnectionController>,
    processor: Arc<MessageProcessor>,
    timezone: Tz,
    queues: RwLock<HashMap<String, QueueHandle>>,
    shutting_down: std::sync::atomic::AtomicBool,
    dedup_sweep: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        dedup_config: DedupConfig,
        webhook_config: WebhookSenderConfig,
        reconnect_config: ReconnectConfig,
        persistence_path: impl Into<std::path::PathBuf>,
        timezone: Tz,
    ) -> Arc<Self> {
        let dedup = Arc::new(DedupStore::new(dedup_config));
        let webhook = Arc::new(WebhookSender::new(webhook_config));
        let persistence = Arc::new(PersistenceStore::new(persistence_path));
        let reconnection = ReconnectionController::new(Arc::clone(&broker), reconnect_config);
        let processor = Arc::new(MessageProcessor::new(Arc::clone(&dedup), Arc::clone(&webhook)));

        Arc::new(Self {
            broker,
            dedup,
            webhook,
            persistence,
            reconnection,
            processor,
            timezone,
            queues: RwLock::new(HashMap::new()),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            dedup_sweep: parking_lot::Mutex::new(None),
        })
    }

    /// Connects the broker, starts the reconnection event listener, and
    /// starts the periodic dedup store sweep.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.broker.connect().await?;
        self.reconnection.spawn_event_listener();

        let dedup = Arc::clone(&self.dedup);
        let interval = dedup.cleanup_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                dedup.sweep_processed();
                dedup.sweep_stale_in_flight();
            }
        });
        *self.dedup_sweep.lock() = Some(handle);

        Ok(())
    }

    /// Re-starts consumption for every queue recorded in the persistence
    /// store, skipping entries that fail validation rather than aborting.
    /// Entries whose queue no longer exists at the broker are dropped from
    /// the store after the pass instead of being retried forever.
    pub async fn restore_persisted(self: &Arc<Self>) -> Result<RestoreReport> {
        let entries = self
            .persistence
            .load_all()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let mut report = RestoreReport::default();
        let mut to_remove = Vec::new();

        for entry in entries {
            if self.queues.read().contains_key(&entry.queue) {
                report.skipped += 1;
                continue;
            }

            let request = StartConsumingRequest {
                queue: entry.queue.clone(),
                webhook_url: entry.webhook_url.clone(),
                min_interval_ms: entry.min_interval_ms,
                max_interval_ms: entry.max_interval_ms,
                business_hours: entry.business_hours,
            };
            match self.start_consuming(request).await {
                Ok(()) => {
                    report.restored += 1;
                }
                Err(EngineError::QueueNotFound(queue)) => {
                    to_remove.push(queue);
                }
                Err(e) => {
                    warn!(queue = entry.queue, error = %e, "failed to restore persisted queue");
                    report.failed += 1;
                }
            }
        }

        for queue in to_remove {
            let _ = self.persistence.remove(&queue).await;
            report.removed += 1;
        }

        Ok(report)
    }

    pub async fn start_consuming(self: &Arc<Self>, request: StartConsumingRequest) -> Result<()> {
        if self.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        if self.queues.read().contains_key(&request.queue) {
            return Err(EngineError::AlreadyConsumed(request.queue));
        }

        let (min, max) = validate_and_sanitise(
            &request.webhook_url,
            request.min_interval_ms,
            request.max_interval_ms,
            request.business_hours,
        )?;

        match self.broker.check_queue(&request.queue).await {
            Ok(_) => {}
            Err(BrokerError::QueueNotFound(_)) => {
                return Err(EngineError::QueueNotFound(request.queue));
            }
            Err(e) => return Err(EngineError::Broker(e)),
        }

        let config = Arc::new(RwLock::new(ConsumerConfig {
            queue: request.queue.clone(),
            webhook_url: request.webhook_url.clone(),
            min_interval_ms: min,
            max_interval_ms: max,
            business_hours: request.business_hours,
            paused: false,
            consumer_tag: None,
            created_at: Utc::now(),
            message_count: 0,
            last_payload: None,
        }));

        self.persistence
            .save(PersistedQueueEntry::new(
                request.queue.clone(),
                config.read().to_persisted(Utc::now()),
            ))
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = self.spawn_queue_task(Arc::clone(&config), shutdown_tx.clone());

        self.queues.write().insert(
            request.queue.clone(),
            QueueHandle {
                state: RwLock::new(QueueState::Starting),
                config,
                task,
                shutdown: shutdown_tx,
            },
        );

        info!(queue = request.queue, "started consuming");
        Ok(())
    }

    fn spawn_queue_task(self: &Arc<Self>, config: Arc<RwLock<ConsumerConfig>>, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            let queue_name = config.read().queue.clone();
            let subscription = match engine.broker.consume(&queue_name).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(queue = queue_name, error = %e, "failed to start consumer");
                    return;
                }
            };

            {
                let mut tag_guard = config.write();
                tag_guard.consumer_tag = Some(subscription.consumer_tag.clone());
            }
            engine.set_state(&queue_name, QueueState::Running);

            let mut deliveries = subscription.deliveries;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    delivery = futures::StreamExt::next(&mut deliveries) => {
                        let Some(delivery) = delivery else { break };
                        let snapshot = config.read().clone();
                        let _disposition = engine
                            .processor
                            .process(delivery, &snapshot, &engine.broker, engine.timezone)
                            .await;
                        config.write().message_count += 1;
                    }
                }
            }
            engine.set_state(&queue_name, QueueState::Stopping);
        })
    }

    fn set_state(&self, queue: &str, state: QueueState) {
        if let Some(handle) = self.queues.read().get(queue) {
            *handle.state.write() = state;
        }
    }

    pub async fn pause_consuming(&self, queue: &str) -> Result<()> {
        let queues = self.queues.read();
        let handle = queues.get(queue).ok_or_else(|| EngineError::QueueNotFound(queue.to_string()))?;
        if *handle.state.read() == QueueState::Paused {
            return Err(EngineError::AlreadyPaused(queue.to_string()));
        }
        handle.config.write().paused = true;
        *handle.state.write() = QueueState::Paused;
        Ok(())
    }

    pub async fn resume_consuming(&self, queue: &str) -> Result<()> {
        let queues = self.queues.read();
        let handle = queues.get(queue).ok_or_else(|| EngineError::QueueNotFound(queue.to_string()))?;
        if *handle.state.read() != QueueState::Paused {
            return Err(EngineError::NotPaused(queue.to_string()));
        }
        handle.config.write().paused = false;
        *handle.state.write() = QueueState::Running;
        Ok(())
    }

    /// Manual stop: cancels the broker consumer and removes both the
    /// in-memory and persisted configuration.
    pub async fn stop_consuming(&self, queue: &str) -> Result<()> {
        let handle = self.remove_queue(queue)?;

        if let Some(tag) = handle.config.read().consumer_tag.clone() {
            let _ = self.broker.cancel_consumer(&tag).await;
        }

        self.persistence
            .remove(queue)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        self.finish_notify(&handle, queue, "stopped").await;
        Ok(())
    }

    /// External-deletion handler: the queue-health monitor calls this when a
    /// passive declare reports the queue gone. Does not attempt to cancel
    /// the consumer tag — there is nothing left at the broker to cancel.
    pub async fn handle_external_deletion(&self, queue: &str) -> Result<()> {
        let handle = self.remove_queue(queue)?;

        self.persistence
            .remove(queue)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        self.finish_notify(&handle, queue, "queue_deleted_externally").await;
        warn!(queue, "queue deleted externally, consumer stopped");
        Ok(())
    }

    fn remove_queue(&self, queue: &str) -> Result<QueueHandle> {
        let handle = self
            .queues
            .write()
            .remove(queue)
            .ok_or_else(|| EngineError::NotConsumed(queue.to_string()))?;
        *handle.state.write() = QueueState::Stopping;
        let _ = handle.shutdown.send(());
        handle.task.abort();
        Ok(handle)
    }

    async fn finish_notify(&self, handle: &QueueHandle, queue: &str, reason: &str) {
        let (webhook_url, last_payload) = {
            let config = handle.config.read();
            (config.webhook_url.clone(), config.last_payload.clone())
        };
        self.webhook.notify_queue_finish(&webhook_url, queue, last_payload.as_ref(), reason).await;
    }


    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        let (state, config) = {
            let queues = self.queues.read();
            let handle = queues.get(queue).ok_or_else(|| EngineError::QueueNotFound(queue.to_string()))?;
            (format!("{:?}", *handle.state.read()), handle.config.read().clone())
        };

        let check = self.broker.check_queue(queue).await.ok();
        let estimated_completion_ms = check.map(|c| {
            let avg = (config.min_interval_ms + config.max_interval_ms) / 2;
            avg.saturating_mul(c.message_count as u64)
        });

        Ok(QueueInfo {
            queue: config.queue.clone(),
            state,
            webhook_url: config.webhook_url.clone(),
            paused: config.paused,
            message_count: config.message_count,
            consumer_count: check.map(|c| c.consumer_count).unwrap_or(0),
            is_active: true,
            estimated_completion_ms,
            config,
        })
    }

    pub async fn active_queues(&self) -> Vec<QueueInfo> {
        let names: Vec<String> = self.queues.read().keys().cloned().collect();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(info) = self.queue_info(&name).await {
                infos.push(info);
            }
        }
        infos
    }

    pub async fn persisted_queues(&self) -> Result<PersistedQueuesReport> {
        let persisted = self
            .persistence
            .load_all()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let stats = self
            .persistence
            .stats()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(PersistedQueuesReport { persisted, stats })
    }

    pub async fn backup_configs(&self, path: Option<PathBuf>) -> Result<PathBuf> {
        self.persistence.backup(path).await.map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn restore_backup(&self, path: PathBuf) -> Result<Vec<String>> {
        self.persistence.restore(&path).await.map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn clear_configs(&self) -> Result<()> {
        self.persistence.clear().await.map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn remove_persisted(&self, queue: &str) -> Result<()> {
        self.persistence.remove(queue).await.map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Probes every persisted queue and drops entries whose queue no longer
    /// exists at the broker. Returns the removed queue names.
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        let entries = self
            .persistence
            .load_all()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let mut removed = Vec::new();
        for entry in entries {
            if let Err(BrokerError::QueueNotFound(_)) = self.broker.check_queue(&entry.queue).await {
                let _ = self.persistence.remove(&entry.queue).await;
                removed.push(entry.queue);
            }
        }
        Ok(removed)
    }

    pub fn reset_stats(&self) {
        self.processor.reset_stats();
        self.webhook.reset_stats();
    }

    pub fn stats(&self) -> EngineStats {
        let dedup_stats = self.dedup.stats();
        let processor_stats = self.processor.stats();
        let webhook_stats = self.webhook.stats();
        EngineStats {
            active_queues: self.queues.read().len(),
            dedup_processed: dedup_stats.processed_count,
            dedup_in_flight: dedup_stats.in_flight_count,
            processor_processed: processor_stats.processed,
            processor_failed: processor_stats.failed,
            processor_duplicates: processor_stats.duplicates,
            processor_skipped: processor_stats.skipped,
            webhook_sent: webhook_stats.sent,
            webhook_failed: webhook_stats.failed,
            webhook_retries: webhook_stats.retries,
            webhook_avg_response_ms: webhook_stats.avg_response_ms,
        }
    }

    /// Stops every queue, drains the dedup store, and disconnects the
    /// broker. Callers apply their own hard deadline around this.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
        self.reconnection.shutdown();
        if let Some(handle) = self.dedup_sweep.lock().take() {
            handle.abort();
        }

        let queue_names: Vec<String> = self.queues.read().keys().cloned().collect();
        for queue in queue_names {
            if let Err(e) = self.stop_consuming(&queue).await {
                warn!(queue, error = %e, "error stopping queue during shutdown");
            }
        }

        self.dedup.shutdown().await;
        self.webhook.shutdown().await;
        let _ = self.broker.disconnect().await;
        info!("consumer engine shut down");
    }

    pub async fn is_broker_ready(&self) -> bool {
        self.broker.is_channel_ready().await
    }

    pub async fn check_queue_exists(&self, queue: &str) -> Result<bool> {
        match self.broker.check_queue(queue).await {
            Ok(_) => Ok(true),
            Err(BrokerError::QueueNotFound(_)) => Ok(false),
            Err(e) => Err(EngineError::Broker(e)),
        }
    }

    pub fn dedup_store(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    pub fn persistence_store(&self) -> &Arc<PersistenceStore> {
        &self.persistence
    }

    pub fn reconnection_controller(&self) -> &Arc<ReconnectionController> {
        &self.reconnection
    }
}

pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use consumer_broker::{BrokerEvent, QueueCheck, Subscription};
    use futures::StreamExt;

    struct FakeBroker {
        missing_queues: Vec<&'static str>,
    }

    impl FakeBroker {
        fn new(missing_queues: Vec<&'static str>) -> Self {
            Self { missing_queues }
        }
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        async fn connect(&self) -> consumer_broker::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> consumer_broker::Result<()> {
            Ok(())
        }
        async fn cleanup(&self) {}
        async fn is_channel_ready(&self) -> bool {
            true
        }
        async fn check_queue(&self, name: &str) -> consumer_broker::Result<QueueCheck> {
            if self.missing_queues.contains(&name) {
                Err(BrokerError::QueueNotFound(name.to_string()))
            } else {
                Ok(QueueCheck {
                    message_count: 3,
                    consumer_count: 1,
                })
            }
        }
        async fn consume(&self, _name: &str) -> consumer_broker::Result<Subscription> {
            Ok(Subscription {
                consumer_tag: "tag-1".to_string(),
                deliveries: futures::stream::pending::<Option<consumer_broker::Delivery>>().boxed(),
            })
        }
        async fn cancel_consumer(&self, _consumer_tag: &str) -> consumer_broker::Result<()> {
            Ok(())
        }
        async fn ack(&self, _delivery_tag: u64) {}
        async fn nack(&self, _delivery_tag: u64, _requeue: bool) {}
        fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
            broadcast::channel(1).1
        }
    }

    fn test_engine(missing_queues: Vec<&'static str>, tmp_path: std::path::PathBuf) -> Arc<ConsumerEngine> {
        let broker: Arc<dyn BrokerClient> = Arc::new(FakeBroker::new(missing_queues));
        ConsumerEngine::new(
            broker,
            DedupConfig::default(),
            WebhookSenderConfig::default(),
            ReconnectConfig::default(),
            tmp_path,
            chrono_tz::UTC,
        )
    }

    fn request(queue: &str) -> StartConsumingRequest {
        StartConsumingRequest {
            queue: queue.to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            min_interval_ms: 1000,
            max_interval_ms: 2000,
            business_hours: BusinessHours::default(),
        }
    }

    #[tokio::test]
    async fn start_consuming_rejects_missing_queue() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(vec!["orders"], dir.path().join("state.json"));

        let err = engine.start_consuming(request("orders")).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn start_consuming_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(vec![], dir.path().join("state.json"));

        engine.start_consuming(request("orders")).await.unwrap();
        let err = engine.start_consuming(request("orders")).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyConsumed(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(vec![], dir.path().join("state.json"));
        engine.start_consuming(request("orders")).await.unwrap();

        engine.pause_consuming("orders").await.unwrap();
        assert!(matches!(
            engine.pause_consuming("orders").await,
            Err(EngineError::AlreadyPaused(_))
        ));

        engine.resume_consuming("orders").await.unwrap();
        assert!(matches!(
            engine.resume_consuming("orders").await,
            Err(EngineError::NotPaused(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_orphans_removes_queues_missing_at_broker() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(vec!["ghost"], dir.path().join("state.json"));

        engine
            .persistence_store()
            .save(PersistedQueueEntry {
                queue: "ghost".to_string(),
                webhook_url: "https://example.com/hook".to_string(),
                min_interval_ms: 1000,
                max_interval_ms: 2000,
                business_hours: BusinessHours::default(),
                saved_at: Utc::now(),
            })
            .await
            .unwrap();

        let removed = engine.cleanup_orphans().await.unwrap();
        assert_eq!(removed, vec!["ghost".to_string()]);
        assert!(!engine.persistence_store().has("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(vec![], dir.path().join("state.json"));
        engine.start_consuming(request("orders")).await.unwrap();

        let backup_path = engine.backup_configs(None).await.unwrap();
        engine.clear_configs().await.unwrap();
        assert!(!engine.persistence_store().has("orders").await.unwrap());

        let queues = engine.restore_backup(backup_path).await.unwrap();
        assert_eq!(queues, vec!["orders".to_string()]);
        assert!(engine.persistence_store().has("orders").await.unwrap());
    }
}
