use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use boreal_core::intake::{IntakeItem, IntakeMessage};
use boreal_core::lock::{seat_lock_key, LockManager, LockToken};
use boreal_core::order::{Order, OrderItem, OrderStatus};
use boreal_core::queue::{Delivery, IntakeConsumer, QueueError};
use boreal_core::repository::{
    Notification, NotificationRepository, OrderRepository, SeatRepository, StoreError,
};
use boreal_core::seat::SeatStatus;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease duration granted per seat lock; the store expires it even if
    /// the holder crashes.
    pub lock_lease: Duration,
    /// How long one reservation attempt waits for a contended seat lock.
    pub lock_acquire_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// The one deterministic result of processing a delivery. `Completed` and
/// `Duplicate` ack; `Rejected` and `BusinessFailure` dead-letter;
/// `Transient` requeues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { order_id: Uuid },
    Duplicate { order_id: Uuid },
    Rejected { reason: String },
    BusinessFailure { reason: String },
    Transient { reason: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed { order_id } => write!(f, "completed order {}", order_id),
            Outcome::Duplicate { order_id } => {
                write!(f, "duplicate of already-processed order {}", order_id)
            }
            Outcome::Rejected { reason } => write!(f, "rejected: {}", reason),
            Outcome::BusinessFailure { reason } => write!(f, "business failure: {}", reason),
            Outcome::Transient { reason } => write!(f, "transient failure: {}", reason),
        }
    }
}

enum CommitError {
    /// Lost the race or the seat vanished: permanent for this message.
    Busy(String),
    /// Infrastructure trouble: the message may be retried.
    Transient(String),
}

/// Consumes intake messages and drives each to exactly one settled outcome:
/// validate, precheck, create the PENDING order, then commit each seat under
/// its own distributed lock, rolling back the whole message if any seat was
/// lost to a concurrent booking.
pub struct FulfillmentWorker {
    seats: Arc<dyn SeatRepository>,
    orders: Arc<dyn OrderRepository>,
    notifications: Arc<dyn NotificationRepository>,
    locks: Arc<dyn LockManager>,
    config: WorkerConfig,
}

impl FulfillmentWorker {
    pub fn new(
        seats: Arc<dyn SeatRepository>,
        orders: Arc<dyn OrderRepository>,
        notifications: Arc<dyn NotificationRepository>,
        locks: Arc<dyn LockManager>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            seats,
            orders,
            notifications,
            locks,
            config,
        }
    }

    /// Settle one delivery: process the message, then ack or nack according
    /// to the outcome. Acknowledgment only ever happens after persistence
    /// has completed.
    pub async fn handle(&self, delivery: Box<dyn Delivery>) -> Result<Outcome, QueueError> {
        let outcome = self.process(delivery.message()).await;
        match &outcome {
            Outcome::Completed { .. } | Outcome::Duplicate { .. } => delivery.ack().await?,
            Outcome::Rejected { reason } | Outcome::BusinessFailure { reason } => {
                delivery.nack(false, Some(reason.clone())).await?
            }
            Outcome::Transient { reason } => delivery.nack(true, Some(reason.clone())).await?,
        }
        Ok(outcome)
    }

    pub async fn process(&self, msg: &IntakeMessage) -> Outcome {
        // Redelivery of a message that already produced a live order is
        // acked without reprocessing, so a lost ack can never double-book.
        match self.orders.find_by_message_id(msg.message_id).await {
            Ok(Some(existing)) if existing.status != OrderStatus::Cancelled => {
                info!(
                    message_id = %msg.message_id,
                    order_id = %existing.id,
                    "skipping duplicate delivery"
                );
                return Outcome::Duplicate {
                    order_id: existing.id,
                };
            }
            Ok(_) => {}
            Err(err) => return self.store_failure("duplicate check", err),
        }

        if let Err(err) = msg.validate() {
            warn!(message_id = %msg.message_id, error = %err, "rejecting malformed intake message");
            return Outcome::Rejected {
                reason: err.to_string(),
            };
        }

        // Optimistic precheck and price aggregation. The authoritative read
        // happens again under the seat lock; this pass only avoids creating
        // orders for requests that are already doomed.
        let mut total_cents = 0i64;
        for item in &msg.items {
            match self.seats.get(item.seat_id).await {
                Ok(Some(seat)) if seat.flight_id != msg.flight_id => {
                    return self
                        .business_failure(
                            msg,
                            format!(
                                "seat {} does not belong to flight {}",
                                item.seat_id, msg.flight_id
                            ),
                        )
                        .await;
                }
                Ok(Some(seat)) if seat.status == SeatStatus::Available => {
                    total_cents += seat.price_cents;
                }
                Ok(Some(seat)) => {
                    return self
                        .business_failure(
                            msg,
                            format!("seat {} is {}", item.seat_id, seat.status),
                        )
                        .await;
                }
                Ok(None) => {
                    return self
                        .business_failure(msg, format!("seat {} does not exist", item.seat_id))
                        .await;
                }
                Err(err) => return self.store_failure("seat precheck", err),
            }
        }

        // The order is persisted before any seat is touched, so a crash
        // mid-commit leaves a PENDING order with partial seats rather than
        // reserved seats with no owning order.
        let order = Order::new(msg.user_id, msg.message_id, total_cents);
        if let Err(err) = self.orders.create_order(&order).await {
            return self.store_failure("order creation", err);
        }
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            user_id = %order.user_id,
            seats = msg.items.len(),
            "created pending order"
        );

        let mut committed: Vec<Uuid> = Vec::new();
        for item in &msg.items {
            match self.commit_seat(&order, item).await {
                Ok(()) => committed.push(item.seat_id),
                Err(CommitError::Busy(reason)) => {
                    warn!(
                        order_id = %order.id,
                        seat_id = %item.seat_id,
                        %reason,
                        "lost the seat race; rolling back this message"
                    );
                    self.rollback(&order, &committed).await;
                    self.cancel(&order).await;
                    return self.business_failure(msg, reason).await;
                }
                Err(CommitError::Transient(reason)) => {
                    warn!(
                        order_id = %order.id,
                        seat_id = %item.seat_id,
                        %reason,
                        "transient failure mid-commit; rolling back before requeue"
                    );
                    self.rollback(&order, &committed).await;
                    self.cancel(&order).await;
                    return Outcome::Transient { reason };
                }
            }
        }

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            seats = committed.len(),
            "order fulfilled"
        );
        Outcome::Completed { order_id: order.id }
    }

    /// Commit one seat under its own lease so different seats on the same
    /// flight proceed in parallel while racers for this seat serialize.
    async fn commit_seat(&self, order: &Order, item: &IntakeItem) -> Result<(), CommitError> {
        let key = seat_lock_key(item.seat_id);
        let token = self
            .locks
            .acquire(&key, self.config.lock_lease, self.config.lock_acquire_timeout)
            .await
            .map_err(|err| CommitError::Transient(err.to_string()))?;

        let result = self.commit_locked(order, item).await;
        self.release_quietly(&key, &token).await;
        result
    }

    async fn commit_locked(&self, order: &Order, item: &IntakeItem) -> Result<(), CommitError> {
        // Authoritative re-read now that we hold the lease: time has passed
        // since the precheck.
        let seat = match self.seats.get(item.seat_id).await {
            Ok(Some(seat)) => seat,
            Ok(None) => {
                return Err(CommitError::Busy(format!(
                    "seat {} does not exist",
                    item.seat_id
                )))
            }
            Err(err) if err.is_transient() => return Err(CommitError::Transient(err.to_string())),
            Err(err) => return Err(CommitError::Busy(err.to_string())),
        };
        if seat.status != SeatStatus::Available {
            return Err(CommitError::Busy(format!("seat {} is {}", seat.id, seat.status)));
        }

        let line = OrderItem::new(
            order.id,
            seat.id,
            &item.passenger_name,
            &item.passenger_document,
            seat.price_cents,
        );
        match self.orders.reserve_seat(&line).await {
            Ok(()) => {
                info!(order_id = %order.id, seat_id = %seat.id, "seat reserved");
                Ok(())
            }
            Err(StoreError::IllegalSeatTransition { from, .. }) => {
                Err(CommitError::Busy(format!("seat {} is {}", seat.id, from)))
            }
            Err(err) if err.is_transient() => Err(CommitError::Transient(err.to_string())),
            Err(err) => Err(CommitError::Busy(err.to_string())),
        }
    }

    /// Undo every seat already committed for this message. Mandatory: a
    /// partially-successful multi-seat booking must never leave the customer
    /// holding an incomplete order.
    async fn rollback(&self, order: &Order, committed: &[Uuid]) {
        for &seat_id in committed {
            let key = seat_lock_key(seat_id);
            let token = match self
                .locks
                .acquire(&key, self.config.lock_lease, self.config.lock_acquire_timeout)
                .await
            {
                Ok(token) => Some(token),
                Err(err) => {
                    // The seat is RESERVED by this order, so no contender
                    // writes it; completing the rollback outranks waiting.
                    error!(seat_id = %seat_id, error = %err, "rolling back without the seat lock");
                    None
                }
            };

            if let Err(err) = self.orders.release_seat(order.id, seat_id).await {
                error!(
                    order_id = %order.id,
                    seat_id = %seat_id,
                    error = %err,
                    "rollback failed to release seat"
                );
            }

            if let Some(token) = token {
                self.release_quietly(&key, &token).await;
            }
        }
    }

    async fn cancel(&self, order: &Order) {
        if let Err(err) = self.orders.update_status(order.id, OrderStatus::Cancelled).await {
            error!(order_id = %order.id, error = %err, "failed to cancel order after rollback");
        }
    }

    async fn release_quietly(&self, key: &str, token: &LockToken) {
        match self.locks.release(key, token).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "seat lease expired before release"),
            Err(err) => warn!(key, error = %err, "failed to release seat lock"),
        }
    }

    fn store_failure(&self, during: &str, err: StoreError) -> Outcome {
        let reason = format!("{} failed: {}", during, err);
        if err.is_transient() {
            Outcome::Transient { reason }
        } else {
            error!(%reason, "permanent store failure");
            Outcome::BusinessFailure { reason }
        }
    }

    /// Record the out-of-band notification; intake is fire-and-forget, so
    /// this is how the requester learns the booking did not go through.
    async fn business_failure(&self, msg: &IntakeMessage, reason: String) -> Outcome {
        let note = Notification::new(
            msg.user_id,
            "Booking failed",
            &format!("Your booking request could not be completed: {}", reason),
        );
        if let Err(err) = self.notifications.push(&note).await {
            warn!(
                user_id = %msg.user_id,
                error = %err,
                "failed to record booking-failure notification"
            );
        }
        Outcome::BusinessFailure { reason }
    }
}

/// Pull-and-settle loop for one consumer. Runs until the queue closes.
pub async fn run_consumer(worker: Arc<FulfillmentWorker>, consumer: Box<dyn IntakeConsumer>) {
    loop {
        match consumer.recv().await {
            Ok(delivery) => {
                let message_id = delivery.message().message_id;
                match worker.handle(delivery).await {
                    Ok(outcome) => info!(%message_id, %outcome, "intake message settled"),
                    Err(err) => error!(%message_id, error = %err, "failed to settle intake message"),
                }
            }
            Err(QueueError::Closed(name)) => {
                info!(queue = %name, "intake queue closed; worker stopping");
                break;
            }
            Err(err) => {
                error!(error = %err, "intake consumer error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// One task per consumer; each consumer carries its own prefetch bound.
pub fn spawn_workers(
    worker: Arc<FulfillmentWorker>,
    consumers: Vec<Box<dyn IntakeConsumer>>,
) -> Vec<JoinHandle<()>> {
    consumers
        .into_iter()
        .map(|consumer| tokio::spawn(run_consumer(worker.clone(), consumer)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use boreal_core::memory::{MemoryLockManager, MemoryQueue, MemoryStore};
    use boreal_core::queue::{DeadLetterReason, IntakePublisher, QueueSettings};
    use boreal_core::seat::{CabinClass, Seat};

    fn queue_settings() -> QueueSettings {
        QueueSettings {
            durable: false,
            message_ttl: None,
            max_length: 100,
            max_deliveries: 3,
            prefetch: 5,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        locks: Arc<MemoryLockManager>,
        worker: FulfillmentWorker,
    }

    fn fixture(config: WorkerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockManager::new(Duration::from_millis(2)));
        let worker = FulfillmentWorker::new(
            store.clone(),
            store.clone(),
            store.clone(),
            locks.clone(),
            config,
        );
        Fixture { store, locks, worker }
    }

    async fn seed_seat(store: &MemoryStore, flight_id: Uuid, price_cents: i64) -> Seat {
        let seat = Seat::new(flight_id, "12A", CabinClass::Economy, price_cents);
        store.insert(&seat).await.unwrap();
        seat
    }

    fn request(user_id: Uuid, flight_id: Uuid, seats: &[Uuid]) -> IntakeMessage {
        IntakeMessage::new(
            user_id,
            flight_id,
            seats
                .iter()
                .map(|seat_id| IntakeItem {
                    seat_id: *seat_id,
                    passenger_name: "Ada Lovelace".to_string(),
                    passenger_document: "P1234567".to_string(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_single_seat_booking_completes() {
        let fx = fixture(WorkerConfig::default());
        let flight_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let seat = seed_seat(&fx.store, flight_id, 25_000).await;

        let msg = request(user_id, flight_id, &[seat.id]);
        let outcome = fx.worker.process(&msg).await;

        let Outcome::Completed { order_id } = outcome else {
            panic!("expected completion, got {}", outcome);
        };
        let (order, items) = fx.store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_cents, 25_000);
        assert_eq!(order.intake_message_id, msg.message_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seat_id, seat.id);
        assert_eq!(items[0].price_cents, 25_000);
        assert_eq!(
            SeatRepository::get(&*fx.store, seat.id).await.unwrap().unwrap().status,
            SeatStatus::Reserved
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_short_circuits() {
        let fx = fixture(WorkerConfig::default());
        let flight_id = Uuid::new_v4();
        let seat = seed_seat(&fx.store, flight_id, 10_000).await;
        let msg = request(Uuid::new_v4(), flight_id, &[seat.id]);

        let first = fx.worker.process(&msg).await;
        let Outcome::Completed { order_id } = first else {
            panic!("expected completion");
        };

        // Same message id again, as after a lost ack.
        let second = fx.worker.process(&msg).await;
        assert_eq!(second, Outcome::Duplicate { order_id });
        let orders = OrderRepository::list_for_user(&*fx.store, msg.user_id)
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn test_structural_failure_dead_letters() {
        let fx = fixture(WorkerConfig::default());
        let queue = MemoryQueue::new("intake", queue_settings());
        let msg = IntakeMessage::new(Uuid::new_v4(), Uuid::new_v4(), vec![]);
        queue.publish(&msg).await.unwrap();

        let delivery = queue.consumer().recv().await.unwrap();
        let outcome = fx.worker.handle(delivery).await.unwrap();

        assert!(matches!(outcome, Outcome::Rejected { .. }));
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::Rejected);
        assert!(OrderRepository::list_for_user(&*fx.store, msg.user_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_seat_is_business_failure_with_notification() {
        let fx = fixture(WorkerConfig::default());
        let flight_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut seat = Seat::new(flight_id, "1A", CabinClass::First, 90_000);
        seat.status = SeatStatus::Reserved;
        fx.store.insert(&seat).await.unwrap();

        let msg = request(user_id, flight_id, &[seat.id]);
        let outcome = fx.worker.process(&msg).await;

        assert!(matches!(outcome, Outcome::BusinessFailure { .. }));
        // No order row for a precheck failure.
        assert!(OrderRepository::list_for_user(&*fx.store, user_id)
            .await
            .unwrap()
            .is_empty());
        let notes = NotificationRepository::list_for_user(&*fx.store, user_id)
            .await
            .unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].body.contains(&seat.id.to_string()));
    }

    /// Delegates to the real store but reports one seat as AVAILABLE on its
    /// first read, reproducing a seat snatched between the optimistic
    /// precheck and the locked re-read.
    struct SnatchedSeat {
        inner: Arc<MemoryStore>,
        seat_id: Uuid,
        fibbed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SeatRepository for SnatchedSeat {
        async fn get(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
            let seat = SeatRepository::get(&*self.inner, seat_id).await?;
            if seat_id == self.seat_id
                && !self.fibbed.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                if let Some(mut fib) = seat.clone() {
                    fib.status = SeatStatus::Available;
                    return Ok(Some(fib));
                }
            }
            Ok(seat)
        }

        async fn insert(&self, seat: &Seat) -> Result<(), StoreError> {
            self.inner.insert(seat).await
        }

        async fn set_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(), StoreError> {
            self.inner.set_status(seat_id, status).await
        }
    }

    #[tokio::test]
    async fn test_lost_race_rolls_back_earlier_seats() {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockManager::new(Duration::from_millis(2)));
        let flight_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let seat_a = seed_seat(&store, flight_id, 20_000).await;
        let seat_b = Seat::new(flight_id, "12B", CabinClass::Economy, 20_000);
        store.insert(&seat_b).await.unwrap();

        // Another order already holds B; the precheck is fed a stale
        // AVAILABLE so the race is lost at the locked re-read.
        let competitor = Order::new(Uuid::new_v4(), Uuid::new_v4(), 20_000);
        store.create_order(&competitor).await.unwrap();
        let theirs = OrderItem::new(competitor.id, seat_b.id, "Grace", "P2", 20_000);
        store.reserve_seat(&theirs).await.unwrap();

        let seats = Arc::new(SnatchedSeat {
            inner: store.clone(),
            seat_id: seat_b.id,
            fibbed: std::sync::atomic::AtomicBool::new(false),
        });
        let worker = FulfillmentWorker::new(
            seats,
            store.clone(),
            store.clone(),
            locks,
            WorkerConfig::default(),
        );

        let msg = request(user_id, flight_id, &[seat_a.id, seat_b.id]);
        let outcome = worker.process(&msg).await;
        assert!(matches!(outcome, Outcome::BusinessFailure { .. }));

        // Seat A was committed first and must be fully rolled back.
        assert_eq!(
            SeatRepository::get(&*store, seat_a.id).await.unwrap().unwrap().status,
            SeatStatus::Available
        );
        let orders = OrderRepository::list_for_user(&*store, user_id)
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
        let (_, items) = store.get_order(orders[0].id).await.unwrap().unwrap();
        assert!(items.is_empty());
        // Seat B still belongs to the competing order.
        assert_eq!(
            SeatRepository::get(&*store, seat_b.id).await.unwrap().unwrap().status,
            SeatStatus::Reserved
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let fx = fixture(WorkerConfig::default());
        let flight_id = Uuid::new_v4();
        let seat = seed_seat(&fx.store, flight_id, 10_000).await;
        let msg = request(Uuid::new_v4(), flight_id, &[seat.id]);

        fx.store.set_unavailable(true);
        let outcome = fx.worker.process(&msg).await;
        assert!(matches!(outcome, Outcome::Transient { .. }));

        // Once the store is back the same message succeeds.
        fx.store.set_unavailable(false);
        assert!(matches!(
            fx.worker.process(&msg).await,
            Outcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_lock_timeout_is_transient() {
        let fx = fixture(WorkerConfig {
            lock_lease: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_millis(40),
        });
        let flight_id = Uuid::new_v4();
        let seat = seed_seat(&fx.store, flight_id, 10_000).await;

        // Another worker holds the seat lease for longer than our acquire
        // timeout.
        let _held = fx
            .locks
            .acquire(
                &seat_lock_key(seat.id),
                Duration::from_secs(30),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let msg = request(Uuid::new_v4(), flight_id, &[seat.id]);
        let outcome = fx.worker.process(&msg).await;
        assert!(matches!(outcome, Outcome::Transient { .. }));
        // The seat itself was never touched.
        assert_eq!(
            SeatRepository::get(&*fx.store, seat.id).await.unwrap().unwrap().status,
            SeatStatus::Available
        );
    }
}
