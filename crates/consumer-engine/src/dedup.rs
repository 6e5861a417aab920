//! Deduplication Store (C2): bounded memory of recently processed message
//! fingerprints, plus tracking of currently in-flight fingerprints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub delivery_tag: u64,
    pub webhook: String,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub processed_count: usize,
    pub in_flight_count: usize,
}

pub struct DedupConfig {
    pub max_processed: usize,
    pub cleanup_interval: Duration,
    pub stale: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_processed: 10_000,
            cleanup_interval: Duration::from_millis(60_000),
            stale: Duration::from_millis(300_000),
        }
    }
}

/// Bounded recently-processed set (oldest evicted by insertion order) plus an
/// in-flight map of fingerprints currently moving through the pipeline.
pub struct DedupStore {
    config: DedupConfig,
    processed: Mutex<IndexSet<String>>,
    in_flight: DashMap<String, InFlightEntry>,
    shutting_down: AtomicBool,
}

impl DedupStore {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            processed: Mutex::new(IndexSet::new()),
            in_flight: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// `"<delivery_tag>_<base64(payload)[0..20]>"`, falling back to
    /// `"<delivery_tag>_<now_ms>"` if anything about the computation is
    /// unavailable. Tying the fingerprint to the delivery tag means a
    /// redelivered message always gets a fresh fingerprint.
    pub fn fingerprint(delivery_tag: u64, payload: &[u8]) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let prefix: String = encoded.chars().take(20).collect();
        if prefix.is_empty() && !payload.is_empty() {
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            return format!("{delivery_tag}_{now_ms}");
        }
        format!("{delivery_tag}_{prefix}")
    }

    pub fn is_processed(&self, fingerprint: &str) -> bool {
        self.processed.lock().contains(fingerprint)
    }

    pub fn mark_processed(&self, fingerprint: &str) {
        let mut processed = self.processed.lock();
        processed.insert(fingerprint.to_string());
        while processed.len() > self.config.max_processed {
            processed.shift_remove_index(0);
        }
    }

    pub fn is_processing(&self, fingerprint: &str) -> bool {
        self.in_flight.contains_key(fingerprint)
    }

    pub fn mark_processing(&self, fingerprint: &str, delivery_tag: u64, webhook: &str) {
        self.in_flight.insert(
            fingerprint.to_string(),
            InFlightEntry {
                delivery_tag,
                webhook: webhook.to_string(),
                started_at: Instant::now(),
            },
        );
    }

    pub fn remove_processing(&self, fingerprint: &str) {
        self.in_flight.remove(fingerprint);
    }

    pub fn clear(&self) {
        self.processed.lock().clear();
        self.in_flight.clear();
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            processed_count: self.processed.lock().len(),
            in_flight_count: self.in_flight.len(),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Evicts processed fingerprints beyond `max_processed`; called on the
    /// periodic cleanup tick in addition to the eager trim in `mark_processed`.
    pub fn sweep_processed(&self) {
        let mut processed = self.processed.lock();
        while processed.len() > self.config.max_processed {
            processed.shift_remove_index(0);
        }
    }

    /// Removes in-flight entries older than `stale`.
    pub fn sweep_stale_in_flight(&self) {
        let cutoff = self.config.stale;
        self.in_flight
            .retain(|_, entry| entry.started_at.elapsed() < cutoff);
    }

    /// Waits up to 30s for in-flight entries to drain, polling every 1s, then
    /// forcibly clears everything.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        while Instant::now() < deadline {
            if self.in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if !self.in_flight.is_empty() {
            info!(
                remaining = self.in_flight.len(),
                "dedup store shutdown: forcibly clearing undrained in-flight entries"
            );
        }
        self.clear();
        debug!("dedup store shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_same_input() {
        let a = DedupStore::fingerprint(42, b"{\"id\":1}");
        let b = DedupStore::fingerprint(42, b"{\"id\":1}");
        assert_eq!(a, b);
        assert!(a.starts_with("42_"));
    }

    #[test]
    fn fingerprint_differs_across_delivery_tags() {
        let a = DedupStore::fingerprint(1, b"payload");
        let b = DedupStore::fingerprint(2, b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn processed_set_evicts_oldest_beyond_capacity() {
        let store = DedupStore::new(DedupConfig {
            max_processed: 2,
            ..DedupConfig::default()
        });
        store.mark_processed("a");
        store.mark_processed("b");
        store.mark_processed("c");

        assert!(!store.is_processed("a"));
        assert!(store.is_processed("b"));
        assert!(store.is_processed("c"));
    }

    #[test]
    fn in_flight_tracking_round_trip() {
        let store = DedupStore::new(DedupConfig::default());
        assert!(!store.is_processing("fp"));
        store.mark_processing("fp", 1, "https://example.com/hook");
        assert!(store.is_processing("fp"));
        store.remove_processing("fp");
        assert!(!store.is_processing("fp"));
    }

    #[test]
    fn stale_in_flight_entries_are_swept() {
        let store = DedupStore::new(DedupConfig {
            stale: Duration::from_millis(0),
            ..DedupConfig::default()
        });
        store.mark_processing("fp", 1, "https://example.com/hook");
        std::thread::sleep(Duration::from_millis(5));
        store.sweep_stale_in_flight();
        assert!(!store.is_processing("fp"));
    }

    #[tokio::test]
    async fn shutdown_clears_state() {
        let store = DedupStore::new(DedupConfig::default());
        store.mark_processed("fp");
        store.shutdown().await;
        assert!(!store.is_processed("fp"));
    }
}
