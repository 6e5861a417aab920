//! Message Processor (C6): the per-delivery pipeline — null-delivery guard,
//! dedup, pause/business-hours gates, webhook dispatch, and disposition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use consumer_broker::{BrokerClient, Delivery};
use consumer_common::{ConsumerConfig, Disposition, DispositionReason};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dedup::DedupStore;
use crate::webhook::{Classification, WebhookSender};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct RawProcessorStats {
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
}

pub struct MessageProcessor {
    dedup: Arc<DedupStore>,
    webhook: Arc<WebhookSender>,
    stats: RawProcessorStats,
}

impl MessageProcessor {
    pub fn new(dedup: Arc<DedupStore>, webhook: Arc<WebhookSender>) -> Self {
        Self {
            dedup,
            webhook,
            stats: RawProcessorStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.stats.processed.store(0, Ordering::Relaxed);
        self.stats.failed.store(0, Ordering::Relaxed);
        self.stats.duplicates.store(0, Ordering::Relaxed);
        self.stats.skipped.store(0, Ordering::Relaxed);
    }

    /// Runs one delivery through the pipeline and returns the disposition the
    /// caller should apply to the broker (ack/nack) plus bookkeeping.
    ///
    /// `delivery: None` signals consumer cancellation (the null-delivery
    /// guard); there is no tag to ack/nack in that case.
    pub async fn process(
        &self,
        delivery: Option<Delivery>,
        config: &ConsumerConfig,
        broker: &Arc<dyn BrokerClient>,
        timezone: Tz,
    ) -> Disposition {
        let Some(delivery) = delivery else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Disposition::Skip {
                reason: DispositionReason::Cancelled,
            };
        };

        let fingerprint = DedupStore::fingerprint(delivery.delivery_tag, &delivery.data);

        if self.dedup.is_processed(&fingerprint) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Disposition::Skip {
                reason: DispositionReason::Duplicate,
            };
        }

        if config.paused {
            broker.nack(delivery.delivery_tag, true).await;
            return Disposition::Nack {
                requeue: true,
                reason: DispositionReason::Paused,
            };
        }

        if !config.business_hours.contains(current_hour(timezone)) {
            broker.nack(delivery.delivery_tag, true).await;
            return Disposition::Nack {
                requeue: true,
                reason: DispositionReason::OutsideBusinessHours,
            };
        }

        self.dedup
            .mark_processing(&fingerprint, delivery.delivery_tag, &config.webhook_url);

        let disposition = self.run_pipeline(&delivery, config).await;

        self.dedup.remove_processing(&fingerprint);
        if matches!(disposition, Disposition::Ack { .. }) {
            self.dedup.mark_processed(&fingerprint);
        }
        match &disposition {
            Disposition::Ack {
                reason: DispositionReason::Success,
            } => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Ack { .. } | Disposition::Nack { .. } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Skip { .. } => {}
        }

        match &disposition {
            Disposition::Ack { .. } => broker.ack(delivery.delivery_tag).await,
            Disposition::Nack { requeue, .. } => broker.nack(delivery.delivery_tag, *requeue).await,
            Disposition::Skip { .. } => {}
        }

        disposition
    }

    /// Payload parse + webhook dispatch, isolated so any panic unwinding
    /// through here is caught and turned into a requeue rather than crashing
    /// the per-queue task.
    async fn run_pipeline(&self, delivery: &Delivery, config: &ConsumerConfig) -> Disposition {
        let payload: serde_json::Value = match serde_json::from_slice(&delivery.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(queue = config.queue, error = %e, "payload parse failed");
                return Disposition::Ack {
                    reason: DispositionReason::ParseError,
                };
            }
        };

        let outcome = std::panic::AssertUnwindSafe(self.webhook.send_with_retry(&config.webhook_url, &payload))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = config.queue, "webhook dispatch panicked, requeueing");
                return Disposition::Nack {
                    requeue: true,
                    reason: DispositionReason::UnexpectedError,
                };
            }
        };

        match result.classification {
            Classification::Success => {
                debug!(queue = config.queue, "webhook delivered");
                Disposition::Ack {
                    reason: DispositionReason::Success,
                }
            }
            Classification::Terminal => {
                warn!(queue = config.queue, status = ?result.status, "webhook rejected permanently");
                Disposition::Ack {
                    reason: DispositionReason::WebhookPermanentError,
                }
            }
            Classification::Retryable => {
                warn!(queue = config.queue, status = ?result.status, "webhook exhausted retries, requeueing");
                Disposition::Nack {
                    requeue: true,
                    reason: DispositionReason::WebhookRetry,
                }
            }
        }
    }
}

fn current_hour(timezone: Tz) -> u32 {
    Utc::now().with_timezone(&timezone).format("%H").to_string().parse().unwrap_or(0)
}

use futures::FutureExt;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupConfig;
    use crate::webhook::WebhookSenderConfig;
    use async_trait::async_trait;
    use consumer_broker::{BrokerEvent, QueueCheck, Subscription};
    use consumer_common::BusinessHours;
    use tokio::sync::broadcast;

    struct NoopBroker {
        acked: parking_lot::Mutex<Vec<u64>>,
        nacked: parking_lot::Mutex<Vec<(u64, bool)>>,
    }

    impl NoopBroker {
        fn new() -> Self {
            Self {
                acked: parking_lot::Mutex::new(Vec::new()),
                nacked: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for NoopBroker {
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
        async fn check_queue(&self, _name: &str) -> consumer_broker::Result<QueueCheck> {
            Ok(QueueCheck::default())
        }
        async fn consume(&self, _name: &str) -> consumer_broker::Result<Subscription> {
            unimplemented!()
        }
        async fn cancel_consumer(&self, _consumer_tag: &str) -> consumer_broker::Result<()> {
            Ok(())
        }
        async fn ack(&self, delivery_tag: u64) {
            self.acked.lock().push(delivery_tag);
        }
        async fn nack(&self, delivery_tag: u64, requeue: bool) {
            self.nacked.lock().push((delivery_tag, requeue));
        }
        fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
            broadcast::channel(1).1
        }
    }

    fn sample_config() -> ConsumerConfig {
        ConsumerConfig {
            queue: "orders".to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            min_interval_ms: 1000,
            max_interval_ms: 2000,
            business_hours: BusinessHours::default(),
            paused: false,
            consumer_tag: None,
            created_at: Utc::now(),
            message_count: 0,
            last_payload: None,
        }
    }

    #[tokio::test]
    async fn null_delivery_skips_without_touching_broker() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let processor = MessageProcessor::new(dedup, webhook);
        let broker: Arc<dyn BrokerClient> = Arc::new(NoopBroker::new());

        let disposition = processor
            .process(None, &sample_config(), &broker, chrono_tz::UTC)
            .await;

        assert_eq!(
            disposition,
            Disposition::Skip {
                reason: DispositionReason::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn paused_queue_requeues_without_dispatch() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let processor = MessageProcessor::new(dedup, webhook);
        let broker: Arc<dyn BrokerClient> = Arc::new(NoopBroker::new());

        let mut config = sample_config();
        config.paused = true;
        let delivery = Delivery {
            delivery_tag: 1,
            data: b"{}".to_vec(),
        };

        let disposition = processor
            .process(Some(delivery), &config, &broker, chrono_tz::UTC)
            .await;

        assert_eq!(
            disposition,
            Disposition::Nack {
                requeue: true,
                reason: DispositionReason::Paused
            }
        );
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_skipped_without_broker_operation() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let fingerprint = DedupStore::fingerprint(1, b"{}");
        dedup.mark_processed(&fingerprint);

        let processor = MessageProcessor::new(dedup, webhook);
        let noop = Arc::new(NoopBroker::new());
        let broker: Arc<dyn BrokerClient> = noop.clone();
        let delivery = Delivery {
            delivery_tag: 1,
            data: b"{}".to_vec(),
        };

        let disposition = processor
            .process(Some(delivery), &sample_config(), &broker, chrono_tz::UTC)
            .await;

        assert_eq!(
            disposition,
            Disposition::Skip {
                reason: DispositionReason::Duplicate
            }
        );
        assert!(noop.acked.lock().is_empty());
        assert!(noop.nacked.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_as_parse_error() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let processor = MessageProcessor::new(dedup, webhook);
        let broker: Arc<dyn BrokerClient> = Arc::new(NoopBroker::new());
        let delivery = Delivery {
            delivery_tag: 1,
            data: b"not json".to_vec(),
        };

        let disposition = processor
            .process(Some(delivery), &sample_config(), &broker, chrono_tz::UTC)
            .await;

        assert_eq!(
            disposition,
            Disposition::Ack {
                reason: DispositionReason::ParseError
            }
        );
    }

    #[tokio::test]
    async fn outside_business_hours_requeues() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let processor = MessageProcessor::new(dedup, webhook);
        let broker: Arc<dyn BrokerClient> = Arc::new(NoopBroker::new());

        let mut config = sample_config();
        config.business_hours = BusinessHours {
            start_hour: 0,
            end_hour: 0,
        };
        let delivery = Delivery {
            delivery_tag: 1,
            data: b"{}".to_vec(),
        };

        let disposition = processor
            .process(Some(delivery), &config, &broker, chrono_tz::UTC)
            .await;

        assert_eq!(
            disposition,
            Disposition::Nack {
                requeue: true,
                reason: DispositionReason::OutsideBusinessHours
            }
        );
    }

    #[tokio::test]
    async fn duplicate_and_parse_error_update_counters_and_reset_clears_them() {
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let webhook = Arc::new(WebhookSender::new(WebhookSenderConfig::default()));
        let processor = MessageProcessor::new(dedup, webhook);
        let broker: Arc<dyn BrokerClient> = Arc::new(NoopBroker::new());

        processor
            .process(
                Some(Delivery {
                    delivery_tag: 1,
                    data: b"not json".to_vec(),
                }),
                &sample_config(),
                &broker,
                chrono_tz::UTC,
            )
            .await;

        let stats = processor.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.duplicates, 0);

        processor.reset_stats();
        let stats = processor.stats();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.duplicates, 0);
    }
}
