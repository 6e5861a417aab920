//! Consumer Engine
//!
//! Consumes messages from an AMQP 0-9-1 broker and delivers them to a
//! per-queue webhook, with deduplication, pause/resume, business-hours
//! gating, persisted state across restarts, and a reconnection controller
//! that reacts to broker lifecycle events.
//!
//! - [`engine::ConsumerEngine`]: orchestrator for per-queue consumption
//! - [`dedup::DedupStore`]: bounded recently-processed + in-flight tracking
//! - [`webhook::WebhookSender`]: retrying HTTP delivery with classification
//! - [`persistence::PersistenceStore`]: atomic on-disk queue state
//! - [`reconnect::ReconnectionController`]: event-driven reconnect with backoff
//! - [`processor::MessageProcessor`]: the per-delivery pipeline
//! - [`queue_health_monitor`]: periodic passive existence sweep
//! - [`api`]: the HTTP control surface

pub mod api;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod health;
pub mod persistence;
pub mod processor;
pub mod queue_health_monitor;
pub mod reconnect;
pub mod webhook;

pub use dedup::{DedupConfig, DedupStore};
pub use engine::{
    ConsumerEngine, EngineStats, PersistedQueuesReport, QueueInfo, QueueState, RestoreReport, StartConsumingRequest,
};
pub use error::EngineError;
pub use persistence::{PersistedQueueEntry, PersistenceStore};
pub use processor::MessageProcessor;
pub use reconnect::{ReconnectConfig, ReconnectionController};
pub use webhook::{WebhookSender, WebhookSenderConfig};

pub type Result<T> = std::result::Result<T, EngineError>;
