use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intake::IntakeMessage;

/// What a broker carries per message: the payload plus the redelivery
/// bookkeeping the queue needs for its TTL and delivery-limit policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: IntakeMessage,
    /// Completed deliveries so far; 0 on the first attempt.
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: IntakeMessage) -> Self {
        Self {
            message,
            delivery_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Consumer rejected without requeue: structural validation failure or
    /// a permanent business failure.
    Rejected,
    /// Redelivered `max_deliveries` times without being settled.
    DeliveryLimit,
    /// Sat on the queue longer than the message TTL.
    Expired,
}

/// Quarantined message plus enough metadata for manual triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub source_queue: String,
    pub reason: DeadLetterReason,
    pub detail: Option<String>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at `max_length`; intake degrades by rejecting new work
    /// instead of growing without bound.
    #[error("queue {0} is full")]
    Full(String),
    #[error("queue {0} is closed")]
    Closed(String),
    #[error("queue payload could not be decoded: {0}")]
    Codec(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        QueueError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Request broker-side persistence where the backend supports it. The
    /// in-memory queue is always volatile and warns when this is set.
    pub durable: bool,
    /// Messages older than this at receive time are dead-lettered.
    pub message_ttl: Option<Duration>,
    pub max_length: usize,
    /// Total deliveries before a message is dead-lettered.
    pub max_deliveries: u32,
    /// Unacknowledged deliveries one consumer may hold at once.
    pub prefetch: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            durable: true,
            message_ttl: Some(Duration::from_secs(30)),
            max_length: 1000,
            max_deliveries: 3,
            prefetch: 5,
        }
    }
}

#[async_trait]
pub trait IntakePublisher: Send + Sync {
    async fn publish(&self, message: &IntakeMessage) -> Result<(), QueueError>;
}

/// One received message. Must be settled exactly once: `ack` after the
/// worker reached a deterministic outcome, `nack(requeue=true)` for
/// transient infrastructure failures, `nack(requeue=false)` to dead-letter.
/// Implementations requeue deliveries that are dropped unsettled, which is
/// what makes the channel at-least-once across worker crashes.
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &IntakeMessage;

    fn delivery_count(&self) -> u32;

    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    async fn nack(self: Box<Self>, requeue: bool, reason: Option<String>)
        -> Result<(), QueueError>;
}

#[async_trait]
pub trait IntakeConsumer: Send + Sync {
    /// Blocks until a message is available and this consumer is under its
    /// prefetch bound.
    async fn recv(&self) -> Result<Box<dyn Delivery>, QueueError>;
}
