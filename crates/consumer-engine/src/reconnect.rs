//! Reconnection Controller (C5): watches broker lifecycle events and drives
//! reconnect attempts with exponential backoff, one pending timer at a time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use consumer_broker::{BrokerClient, BrokerEvent};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cooldown: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            cooldown: Duration::from_millis(500),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectStats {
    pub attempts: u32,
    pub in_progress: bool,
}

/// Reacts to `BrokerEvent::ConnectionError`/`ConnectionClosed`/`ChannelError`
/// and `NeedsReconnection` by scheduling a single pending reconnect attempt at
/// a time. Superseded timers are cancelled via a generation counter rather
/// than by holding the previous `JoinHandle` and aborting it directly, so a
/// retry triggered mid-sleep by a fresh event always wins cleanly.
pub struct ReconnectionController {
    broker: Arc<dyn BrokerClient>,
    config: ReconnectConfig,
    attempts: AtomicU32,
    in_progress: AtomicBool,
    shutting_down: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    generation: Arc<AtomicU64>,
    pending_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionController {
    pub fn new(broker: Arc<dyn BrokerClient>, config: ReconnectConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            attempts: AtomicU32::new(0),
            in_progress: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            pending_timer: Mutex::new(None),
        })
    }

    /// Spawns the task that observes the broker's event stream and reacts.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let mut events = controller.broker.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BrokerEvent::ConnectionError(reason))
                    | Ok(BrokerEvent::ChannelError(reason))
                    | Ok(BrokerEvent::NeedsReconnection(reason)) => {
                        warn!(reason, "reconnection controller observed a reconnect-worthy event");
                        controller.schedule_reconnect();
                    }
                    Ok(BrokerEvent::ConnectionClosed) | Ok(BrokerEvent::ChannelClosed) => {
                        controller.schedule_reconnect();
                    }
                    Ok(BrokerEvent::Connected) => {
                        controller.attempts.store(0, Ordering::SeqCst);
                    }
                    Ok(BrokerEvent::ConsumerCancelled(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Guard chain: not shutting down, not already in progress, channel
    /// actually unready, attempt budget remains, and past the cooldown since
    /// the last attempt.
    pub async fn should_attempt(&self) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        if self.in_progress.load(Ordering::SeqCst) {
            return false;
        }
        if self.broker.is_channel_ready().await {
            return false;
        }
        if let Some(max) = self.config.max_attempts {
            if self.attempts.load(Ordering::SeqCst) >= max {
                return false;
            }
        }
        let cooled_down = self
            .last_attempt
            .lock()
            .map(|t| t.elapsed() >= self.config.cooldown)
            .unwrap_or(true);
        cooled_down
    }

    /// Cancels any previously scheduled timer and schedules a fresh one with
    /// exponential backoff capped at `max_delay`.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let attempt = self.attempts.load(Ordering::SeqCst);
        let delay = backoff_delay(attempt, self.config.base_delay, self.config.max_delay);

        let controller = Arc::clone(self);
        let generation_ref = Arc::clone(&self.generation);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generation_ref.load(Ordering::SeqCst) != my_generation {
                return;
            }
            controller.attempt_reconnect().await;
        });

        if let Some(old) = self.pending_timer.lock().replace(handle) {
            old.abort();
        }
    }

    /// Bypasses backoff and cooldown, attempting immediately.
    pub async fn force_reconnect(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = self.pending_timer.lock().take() {
            old.abort();
        }
        self.attempt_reconnect().await;
    }

    async fn attempt_reconnect(&self) {
        if !self.should_attempt().await && self.broker.is_channel_ready().await {
            return;
        }

        self.in_progress.store(true, Ordering::SeqCst);
        *self.last_attempt.lock() = Some(Instant::now());
        let attempt_number = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        self.broker.cleanup().await;
        match self.broker.connect().await {
            Ok(()) => {
                info!(attempt_number, "reconnection attempt succeeded");
                self.attempts.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(attempt_number, error = %e, "reconnection attempt failed");
            }
        }
        self.in_progress.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            attempts: self.attempts.load(Ordering::SeqCst),
            in_progress: self.in_progress.load(Ordering::SeqCst),
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.pending_timer.lock().take() {
            handle.abort();
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(20));
    let delay = base.saturating_mul(exp.min(u32::MAX as u64) as u32);
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_then_saturates_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, base, max), max);
    }
}
