//! List-backed intake queue. The main list holds JSON envelopes; each
//! consumer moves a message into its own pending list while working on it
//! (LMOVE), removes it on settle (LREM) and a restarting consumer drains
//! its pending list back to the main one, which is what makes the channel
//! at-least-once across worker crashes. Durability is whatever the Redis
//! server's persistence config provides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Direction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use boreal_core::intake::IntakeMessage;
use boreal_core::queue::{
    DeadLetter, DeadLetterReason, Delivery, Envelope, IntakeConsumer, IntakePublisher, QueueError,
    QueueSettings,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct QueueShared {
    client: redis::Client,
    name: String,
    settings: QueueSettings,
}

impl QueueShared {
    fn main_key(&self) -> String {
        format!("queue:{}", self.name)
    }

    fn pending_key(&self, consumer_id: &str) -> String {
        format!("queue:{}:pending:{}", self.name, consumer_id)
    }

    fn dead_key(&self) -> String {
        format!("queue:{}:dead", self.name)
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::backend)
    }

    async fn push_dead(
        &self,
        conn: &mut MultiplexedConnection,
        envelope: Envelope,
        reason: DeadLetterReason,
        detail: Option<String>,
    ) -> Result<(), QueueError> {
        let letter = DeadLetter {
            envelope,
            source_queue: self.name.clone(),
            reason,
            detail,
            failed_at: Utc::now(),
        };
        let payload =
            serde_json::to_string(&letter).map_err(|err| QueueError::Codec(err.to_string()))?;
        conn.lpush::<_, _, ()>(self.dead_key(), payload)
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }

    /// Redelivery bookkeeping shared by nack-with-requeue and crash
    /// recovery: bump the count, dead-letter once the limit is reached.
    async fn requeue(
        &self,
        conn: &mut MultiplexedConnection,
        mut envelope: Envelope,
        detail: Option<String>,
    ) -> Result<(), QueueError> {
        envelope.delivery_count += 1;
        if envelope.delivery_count >= self.settings.max_deliveries {
            return self
                .push_dead(conn, envelope, DeadLetterReason::DeliveryLimit, detail)
                .await;
        }
        let payload =
            serde_json::to_string(&envelope).map_err(|err| QueueError::Codec(err.to_string()))?;
        conn.lpush::<_, _, ()>(self.main_key(), payload)
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    shared: Arc<QueueShared>,
}

impl RedisQueue {
    pub fn new(url: &str, name: &str, settings: QueueSettings) -> Result<Self, redis::RedisError> {
        Ok(Self {
            shared: Arc::new(QueueShared {
                client: redis::Client::open(url)?,
                name: name.to_string(),
                settings,
            }),
        })
    }

    pub fn consumer(&self, consumer_id: &str) -> RedisConsumer {
        RedisConsumer {
            shared: self.shared.clone(),
            consumer_id: consumer_id.to_string(),
            prefetch: Arc::new(Semaphore::new(self.shared.settings.prefetch.max(1))),
        }
    }

    /// Drain deliveries a previous incarnation of `consumer_id` left
    /// unsettled back onto the main queue. Run before consuming.
    pub async fn recover(&self, consumer_id: &str) -> Result<u64, QueueError> {
        let mut conn = self.shared.conn().await?;
        let pending = self.shared.pending_key(consumer_id);
        let mut recovered = 0u64;
        loop {
            let payload: Option<String> = conn
                .rpop(&pending, None)
                .await
                .map_err(QueueError::backend)?;
            let Some(payload) = payload else {
                break;
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => {
                    self.shared
                        .requeue(
                            &mut conn,
                            envelope,
                            Some("delivery left unsettled by a crashed consumer".to_string()),
                        )
                        .await?;
                    recovered += 1;
                }
                Err(err) => {
                    warn!(queue = %self.shared.name, error = %err, "dropping undecodable pending entry");
                    conn.lpush::<_, _, ()>(self.shared.dead_key(), &payload)
                        .await
                        .map_err(QueueError::backend)?;
                }
            }
        }
        if recovered > 0 {
            info!(
                queue = %self.shared.name,
                consumer = %consumer_id,
                recovered,
                "requeued unsettled deliveries"
            );
        }
        Ok(recovered)
    }
}

#[async_trait]
impl IntakePublisher for RedisQueue {
    async fn publish(&self, message: &IntakeMessage) -> Result<(), QueueError> {
        let mut conn = self.shared.conn().await?;
        let main = self.shared.main_key();
        // Best-effort depth bound; racing publishers may overshoot by a few.
        let depth: usize = conn.llen(&main).await.map_err(QueueError::backend)?;
        if depth >= self.shared.settings.max_length {
            return Err(QueueError::Full(self.shared.name.clone()));
        }
        let payload = serde_json::to_string(&Envelope::new(message.clone()))
            .map_err(|err| QueueError::Codec(err.to_string()))?;
        conn.lpush::<_, _, ()>(&main, payload)
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }
}

pub struct RedisConsumer {
    shared: Arc<QueueShared>,
    consumer_id: String,
    prefetch: Arc<Semaphore>,
}

#[async_trait]
impl IntakeConsumer for RedisConsumer {
    async fn recv(&self) -> Result<Box<dyn Delivery>, QueueError> {
        let slot = self
            .prefetch
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed(self.shared.name.clone()))?;
        let mut conn = self.shared.conn().await?;
        let main = self.shared.main_key();
        let pending = self.shared.pending_key(&self.consumer_id);
        loop {
            let payload: Option<String> = conn
                .lmove(&main, &pending, Direction::Right, Direction::Left)
                .await
                .map_err(QueueError::backend)?;
            let Some(payload) = payload else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };

            let envelope: Envelope = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    // Quarantine the raw payload; it cannot be wrapped in a
                    // DeadLetter without a decoded envelope.
                    warn!(queue = %self.shared.name, error = %err, "undecodable intake payload");
                    conn.lrem::<_, _, ()>(&pending, 1, &payload)
                        .await
                        .map_err(QueueError::backend)?;
                    conn.lpush::<_, _, ()>(self.shared.dead_key(), &payload)
                        .await
                        .map_err(QueueError::backend)?;
                    continue;
                }
            };

            if let Some(ttl) = self.shared.settings.message_ttl {
                let age = (Utc::now() - envelope.enqueued_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age >= ttl {
                    conn.lrem::<_, _, ()>(&pending, 1, &payload)
                        .await
                        .map_err(QueueError::backend)?;
                    self.shared
                        .push_dead(&mut conn, envelope, DeadLetterReason::Expired, None)
                        .await?;
                    continue;
                }
            }

            return Ok(Box::new(RedisDelivery {
                shared: self.shared.clone(),
                pending_key: pending.clone(),
                payload,
                envelope,
                _slot: slot,
            }));
        }
    }
}

/// One in-flight message, parked in the consumer's pending list until it is
/// settled. There is no drop handler: a delivery lost to a crash stays in
/// the pending list and is requeued by `RedisQueue::recover` on restart.
struct RedisDelivery {
    shared: Arc<QueueShared>,
    pending_key: String,
    payload: String,
    envelope: Envelope,
    _slot: OwnedSemaphorePermit,
}

impl RedisDelivery {
    async fn settle(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        conn.lrem::<_, _, ()>(&self.pending_key, 1, &self.payload)
            .await
            .map_err(QueueError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl Delivery for RedisDelivery {
    fn message(&self) -> &IntakeMessage {
        &self.envelope.message
    }

    fn delivery_count(&self) -> u32 {
        self.envelope.delivery_count
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut conn = self.shared.conn().await?;
        self.settle(&mut conn).await
    }

    async fn nack(
        self: Box<Self>,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        let mut conn = self.shared.conn().await?;
        self.settle(&mut conn).await?;
        if requeue {
            self.shared
                .requeue(&mut conn, self.envelope.clone(), reason)
                .await
        } else {
            self.shared
                .push_dead(
                    &mut conn,
                    self.envelope.clone(),
                    DeadLetterReason::Rejected,
                    reason,
                )
                .await
        }
    }
}
