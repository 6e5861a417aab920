//! Broker Client (C1): a thin, event-emitting wrapper around a single AMQP
//! 0-9-1 connection and channel.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

pub mod classify;
pub mod error;
pub mod rabbitmq;

pub use error::BrokerError;
pub use rabbitmq::{RabbitMqBroker, RabbitMqConfig};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A single delivered message, broker-agnostic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
}

/// Result of a passive queue check.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCheck {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Lifecycle events emitted by a [`BrokerClient`]. Mirrors the source's dynamic
/// event emitter as an enumerated, typed broadcast instead of callback registration.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Connected,
    ConnectionError(String),
    ConnectionClosed,
    ChannelError(String),
    ChannelClosed,
    ConsumerCancelled(String),
    NeedsReconnection(String),
}

/// A live subscription: its broker-assigned tag and a stream of deliveries.
/// `None` items on the stream signal consumer cancellation (the null-delivery
/// guard of the message-processing pipeline).
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: BoxStream<'static, Option<Delivery>>,
}

/// Opens connection + channel, wraps publish/ack/nack/consume/checkQueue, and
/// emits lifecycle events over a broadcast channel observed by the
/// reconnection controller and the consumer engine.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the connection and channel. Idempotent: calling while already
    /// connected is a no-op that returns `Ok`.
    async fn connect(&self) -> Result<()>;

    /// Close the connection and channel without forgetting configuration,
    /// ahead of a fresh `connect`.
    async fn disconnect(&self) -> Result<()>;

    /// Drop any stale connection/channel handles, as a precursor to a
    /// reconnect attempt. Unlike `disconnect`, tolerates an already-dead
    /// connection.
    async fn cleanup(&self);

    /// True iff both connection and channel are present, neither is
    /// closing/closed, and the client is not shutting down.
    async fn is_channel_ready(&self) -> bool;

    /// Passively declare the queue to read its current depth without
    /// mutating broker state.
    async fn check_queue(&self, name: &str) -> Result<QueueCheck>;

    /// Register a consumer on `name` with prefetch 1. Returns the
    /// broker-assigned consumer tag and a stream of deliveries.
    async fn consume(&self, name: &str) -> Result<Subscription>;

    /// Cancel a previously registered consumer.
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery. A no-op (not an error) when the channel is not
    /// ready, and silently swallows "unknown delivery tag" (AMQP 406).
    async fn ack(&self, delivery_tag: u64);

    /// Negative-acknowledge a delivery. Same no-op/swallow rules as `ack`.
    async fn nack(&self, delivery_tag: u64, requeue: bool);

    /// Subscribe to this client's lifecycle events.
    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent>;
}
