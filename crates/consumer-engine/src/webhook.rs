//! Webhook Sender (C3): HTTP POST with timeout, exponential-backoff retry,
//! 4xx/5xx classification, and running statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WebhookSenderConfig {
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for WebhookSenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Status classification for a single HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Retryable,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub classification: Classification,
    pub status: Option<u16>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SendWithRetryResult {
    pub classification: Classification,
    pub status: Option<u16>,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub status: Option<u16>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub sent: u64,
    pub failed: u64,
    pub retries: u64,
    pub avg_response_ms: u64,
}

#[derive(Default)]
struct RawStats {
    sent: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    total_response_ms: AtomicU64,
    response_samples: AtomicU64,
}

pub struct WebhookSender {
    client: Client,
    config: WebhookSenderConfig,
    stats: RawStats,
    extra_headers: Mutex<Vec<(String, String)>>,
}

impl WebhookSender {
    pub fn new(config: WebhookSenderConfig) -> Self {
        let client = Client::builder()
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self {
            client,
            config,
            stats: RawStats::default(),
            extra_headers: Mutex::new(Vec::new()),
        }
    }

    /// One HTTP POST attempt with JSON body and a per-call timeout.
    pub async fn send(&self, url: &str, payload: &Value) -> AttemptOutcome {
        self.send_with_timeout(url, payload, self.config.timeout).await
    }

    async fn send_with_timeout(&self, url: &str, payload: &Value, timeout: Duration) -> AttemptOutcome {
        let start = std::time::Instant::now();
        let mut request = self.client.post(url).json(payload).timeout(timeout);
        for (name, value) in self.extra_headers.lock().iter() {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let elapsed = start.elapsed();
                let classification = classify_status(status);
                AttemptOutcome {
                    classification,
                    status: Some(status),
                    elapsed,
                }
            }
            Err(e) => {
                let elapsed = start.elapsed();
                debug!(url, error = %e, "webhook request failed");
                AttemptOutcome {
                    classification: Classification::Retryable,
                    status: None,
                    elapsed,
                }
            }
        }
    }

    /// Repeats up to `max_attempts` with delay `base * 2^(attempt-1)`,
    /// aborting early on a terminal (4xx) classification.
    pub async fn send_with_retry(&self, url: &str, payload: &Value) -> SendWithRetryResult {
        let overall_start = std::time::Instant::now();
        let mut last = AttemptOutcome {
            classification: Classification::Retryable,
            status: None,
            elapsed: Duration::ZERO,
        };

        let mut attempts = 0u32;
        for attempt in 1..=self.config.max_attempts {
            last = self.send(url, payload).await;
            self.record_attempt(&last);
            attempts = attempt;

            match last.classification {
                Classification::Success => break,
                Classification::Terminal => break,
                Classification::Retryable => {
                    if attempt < self.config.max_attempts {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                        warn!(url, attempt, ?delay, "webhook attempt retryable, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        SendWithRetryResult {
            classification: last.classification,
            status: last.status,
            attempts,
            elapsed: overall_start.elapsed(),
        }
    }

    fn record_attempt(&self, outcome: &AttemptOutcome) {
        match outcome.classification {
            Classification::Success => self.stats.sent.fetch_add(1, Ordering::Relaxed),
            _ => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.stats.total_response_ms.fetch_add(outcome.elapsed.as_millis() as u64, Ordering::Relaxed);
        self.stats.response_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Small well-known probe payload. Uses the configured probe timeout
    /// unless the caller supplies an override.
    pub async fn test_webhook(&self, url: &str, timeout_override: Option<Duration>) -> ProbeResult {
        let probe = serde_json::json!({ "test": true, "source": "consumer-engine" });
        let timeout = timeout_override.unwrap_or(self.config.probe_timeout);
        let outcome = self.send_with_timeout(url, &probe, timeout).await;
        ProbeResult {
            success: outcome.classification == Classification::Success,
            status: outcome.status,
            elapsed: outcome.elapsed,
        }
    }

    /// Best-effort finish notification; failures never propagate.
    pub async fn notify_queue_finish(&self, finish_webhook_url: &str, queue: &str, last_payload: Option<&Value>, reason: &str) {
        let body = serde_json::json!({
            "queue": queue,
            "reason": reason,
            "lastPayload": last_payload,
        });
        let outcome = self.send(finish_webhook_url, &body).await;
        if outcome.classification != Classification::Success {
            debug!(queue, reason, status = ?outcome.status, "finish notification failed, ignoring");
        }
    }

    pub fn stats(&self) -> SenderStats {
        let samples = self.stats.response_samples.load(Ordering::Relaxed).max(1);
        SenderStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            avg_response_ms: self.stats.total_response_ms.load(Ordering::Relaxed) / samples,
        }
    }

    pub fn reset_stats(&self) {
        self.stats.sent.store(0, Ordering::Relaxed);
        self.stats.failed.store(0, Ordering::Relaxed);
        self.stats.retries.store(0, Ordering::Relaxed);
        self.stats.total_response_ms.store(0, Ordering::Relaxed);
        self.stats.response_samples.store(0, Ordering::Relaxed);
    }

    pub async fn shutdown(&self) {
        debug!("webhook sender shut down");
    }
}

fn classify_status(status: u16) -> Classification {
    if (200..400).contains(&status) {
        Classification::Success
    } else if (400..500).contains(&status) {
        Classification::Terminal
    } else {
        Classification::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classify_status_boundaries() {
        assert_eq!(classify_status(200), Classification::Success);
        assert_eq!(classify_status(399), Classification::Success);
        assert_eq!(classify_status(404), Classification::Terminal);
        assert_eq!(classify_status(499), Classification::Terminal);
        assert_eq!(classify_status(500), Classification::Retryable);
        assert_eq!(classify_status(503), Classification::Retryable);
    }

    #[tokio::test]
    async fn success_response_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(WebhookSenderConfig::default());
        let result = sender
            .send_with_retry(&format!("{}/hook", server.uri()), &serde_json::json!({"id": 1}))
            .await;

        assert_eq!(result.classification, Classification::Success);
        assert_eq!(result.attempts, 1);
        assert_eq!(sender.stats().sent, 1);
    }

    #[tokio::test]
    async fn terminal_status_aborts_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(WebhookSenderConfig {
            retry_base_delay: Duration::from_millis(1),
            ..WebhookSenderConfig::default()
        });
        let result = sender
            .send_with_retry(&format!("{}/hook", server.uri()), &serde_json::json!({}))
            .await;

        assert_eq!(result.classification, Classification::Terminal);
        assert_eq!(result.status, Some(404));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn server_error_retries_up_to_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(WebhookSenderConfig {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            ..WebhookSenderConfig::default()
        });
        let result = sender
            .send_with_retry(&format!("{}/hook", server.uri()), &serde_json::json!({}))
            .await;

        assert_eq!(result.classification, Classification::Retryable);
        assert_eq!(result.attempts, 3);
        assert_eq!(sender.stats().retries, 2);
    }
}
