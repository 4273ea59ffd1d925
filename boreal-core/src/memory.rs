//! In-process implementations of the pipeline seams: a lock manager, an
//! intake queue with dead-letter routing, and a combined store. They honor
//! the same contracts as the Redis/Postgres adapters and back the test
//! suite and local development.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;
use uuid::Uuid;

use crate::intake::IntakeMessage;
use crate::lock::{LockError, LockManager, LockToken};
use crate::order::{Order, OrderItem, OrderStatus};
use crate::queue::{
    DeadLetter, DeadLetterReason, Delivery, Envelope, IntakeConsumer, IntakePublisher, QueueError,
    QueueSettings,
};
use crate::repository::{
    Notification, NotificationRepository, OrderRepository, SeatRepository, StoreError,
};
use crate::seat::{Seat, SeatStatus};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

/// Single-process `LockManager` over a keyed lease table. Leases expire
/// lazily: an expired entry counts as absent for the next acquirer.
pub struct MemoryLockManager {
    retry_interval: Duration,
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockManager {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        let started = Instant::now();
        loop {
            let now = Instant::now();
            {
                let mut leases = guard(&self.leases);
                match leases.entry(key.to_string()) {
                    Entry::Vacant(slot) => {
                        slot.insert((token.value().to_string(), now + lease));
                        return Ok(token);
                    }
                    Entry::Occupied(mut slot) if slot.get().1 <= now => {
                        slot.insert((token.value().to_string(), now + lease));
                        return Ok(token);
                    }
                    Entry::Occupied(_) => {}
                }
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let remaining = timeout - waited;
            tokio::time::sleep(self.retry_interval.min(remaining)).await;
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut leases = guard(&self.leases);
        match leases.get(key) {
            Some((held, expires_at)) if held == token.value() && *expires_at > Instant::now() => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake queue
// ---------------------------------------------------------------------------

struct QueueInner {
    ready: VecDeque<Envelope>,
    dead: Vec<DeadLetter>,
}

struct QueueShared {
    name: String,
    settings: QueueSettings,
    inner: Mutex<QueueInner>,
    /// One permit per message in `ready`.
    available: Semaphore,
}

impl QueueShared {
    fn dead_letter(&self, envelope: Envelope, reason: DeadLetterReason, detail: Option<String>) {
        let mut inner = guard(&self.inner);
        inner.dead.push(DeadLetter {
            envelope,
            source_queue: self.name.clone(),
            reason,
            detail,
            failed_at: Utc::now(),
        });
    }

    /// Redelivery bookkeeping shared by nack-with-requeue and unsettled
    /// drops: bump the count, dead-letter once the limit is reached.
    fn requeue(&self, mut envelope: Envelope, detail: Option<String>) {
        envelope.delivery_count += 1;
        if envelope.delivery_count >= self.settings.max_deliveries {
            self.dead_letter(envelope, DeadLetterReason::DeliveryLimit, detail);
            return;
        }
        {
            let mut inner = guard(&self.inner);
            inner.ready.push_back(envelope);
        }
        self.available.add_permits(1);
    }
}

/// In-process intake queue with the same policy surface as the broker:
/// bounded depth, message TTL, delivery limit, per-consumer prefetch and a
/// dead-letter channel. Volatile by definition.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<QueueShared>,
}

impl MemoryQueue {
    pub fn new(name: &str, settings: QueueSettings) -> Self {
        if settings.durable {
            warn!(queue = %name, "in-memory queue is volatile; the durable flag has no effect");
        }
        Self {
            shared: Arc::new(QueueShared {
                name: name.to_string(),
                settings,
                inner: Mutex::new(QueueInner {
                    ready: VecDeque::new(),
                    dead: Vec::new(),
                }),
                available: Semaphore::new(0),
            }),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            shared: self.shared.clone(),
            prefetch: Arc::new(Semaphore::new(self.shared.settings.prefetch.max(1))),
        }
    }

    pub fn depth(&self) -> usize {
        guard(&self.shared.inner).ready.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        guard(&self.shared.inner).dead.clone()
    }
}

#[async_trait]
impl IntakePublisher for MemoryQueue {
    async fn publish(&self, message: &IntakeMessage) -> Result<(), QueueError> {
        {
            let mut inner = guard(&self.shared.inner);
            if inner.ready.len() >= self.shared.settings.max_length {
                return Err(QueueError::Full(self.shared.name.clone()));
            }
            inner.ready.push_back(Envelope::new(message.clone()));
        }
        self.shared.available.add_permits(1);
        Ok(())
    }
}

pub struct MemoryConsumer {
    shared: Arc<QueueShared>,
    prefetch: Arc<Semaphore>,
}

#[async_trait]
impl IntakeConsumer for MemoryConsumer {
    async fn recv(&self) -> Result<Box<dyn Delivery>, QueueError> {
        loop {
            let slot = self
                .prefetch
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QueueError::Closed(self.shared.name.clone()))?;
            let ready = self
                .shared
                .available
                .acquire()
                .await
                .map_err(|_| QueueError::Closed(self.shared.name.clone()))?;
            ready.forget();

            let envelope = {
                let mut inner = guard(&self.shared.inner);
                inner.ready.pop_front()
            };
            let Some(envelope) = envelope else {
                continue;
            };

            if let Some(ttl) = self.shared.settings.message_ttl {
                let age = (Utc::now() - envelope.enqueued_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if age >= ttl {
                    self.shared
                        .dead_letter(envelope, DeadLetterReason::Expired, None);
                    drop(slot);
                    continue;
                }
            }

            return Ok(Box::new(MemoryDelivery {
                shared: self.shared.clone(),
                envelope,
                settled: false,
                _slot: Some(slot),
            }));
        }
    }
}

struct MemoryDelivery {
    shared: Arc<QueueShared>,
    envelope: Envelope,
    settled: bool,
    _slot: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn message(&self) -> &IntakeMessage {
        &self.envelope.message
    }

    fn delivery_count(&self) -> u32 {
        self.envelope.delivery_count
    }

    async fn ack(mut self: Box<Self>) -> Result<(), QueueError> {
        self.settled = true;
        Ok(())
    }

    async fn nack(
        mut self: Box<Self>,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<(), QueueError> {
        self.settled = true;
        let envelope = self.envelope.clone();
        if requeue {
            self.shared.requeue(envelope, reason);
        } else {
            self.shared
                .dead_letter(envelope, DeadLetterReason::Rejected, reason);
        }
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        // A delivery dropped without ack/nack was held by a crashed worker:
        // put it back so another worker sees it (at-least-once).
        if !self.settled {
            self.shared.requeue(
                self.envelope.clone(),
                Some("delivery dropped unsettled".to_string()),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    seats: HashMap<Uuid, Seat>,
    orders: HashMap<Uuid, Order>,
    items: HashMap<Uuid, Vec<OrderItem>>,
    notifications: Vec<Notification>,
}

/// Keyed-map store implementing all three repositories behind one mutex, so
/// the combined reserve/release operations are atomic exactly like their
/// SQL-transaction counterparts. `set_unavailable` simulates a store outage
/// for exercising the transient-failure path.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Backend("simulated store outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SeatRepository for MemoryStore {
    async fn get(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        self.check_available()?;
        Ok(guard(&self.inner).seats.get(&seat_id).cloned())
    }

    async fn insert(&self, seat: &Seat) -> Result<(), StoreError> {
        self.check_available()?;
        guard(&self.inner).seats.insert(seat.id, seat.clone());
        Ok(())
    }

    async fn set_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        let seat = inner
            .seats
            .get_mut(&seat_id)
            .ok_or(StoreError::SeatNotFound(seat_id))?;
        if !seat.status.can_transition(status) {
            return Err(StoreError::IllegalSeatTransition {
                from: seat.status,
                to: status,
            });
        }
        seat.status = status;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        inner.orders.insert(order.id, order.clone());
        inner.items.entry(order.id).or_default();
        Ok(())
    }

    async fn get_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(Order, Vec<OrderItem>)>, StoreError> {
        self.check_available()?;
        let inner = guard(&self.inner);
        Ok(inner.orders.get(&order_id).map(|order| {
            let items = inner.items.get(&order_id).cloned().unwrap_or_default();
            (order.clone(), items)
        }))
    }

    async fn find_by_message_id(&self, message_id: Uuid) -> Result<Option<Order>, StoreError> {
        self.check_available()?;
        let inner = guard(&self.inner);
        // A live order outranks a cancelled one for the same message, the
        // way the partial unique index resolves it in Postgres.
        let mut cancelled: Option<&Order> = None;
        for order in inner
            .orders
            .values()
            .filter(|order| order.intake_message_id == message_id)
        {
            if order.status != OrderStatus::Cancelled {
                return Ok(Some(order.clone()));
            }
            cancelled = Some(order);
        }
        Ok(cancelled.cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;
        let inner = guard(&self.inner);
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        if !order.status.can_transition(status) {
            return Err(StoreError::IllegalOrderTransition {
                from: order.status,
                to: status,
            });
        }
        order.status = status;
        if status == OrderStatus::Paid {
            order.paid_at = Some(Utc::now());
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn reserve_seat(&self, item: &OrderItem) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        if !inner.orders.contains_key(&item.order_id) {
            return Err(StoreError::OrderNotFound(item.order_id));
        }
        let seat = inner
            .seats
            .get_mut(&item.seat_id)
            .ok_or(StoreError::SeatNotFound(item.seat_id))?;
        if !seat.status.can_transition(SeatStatus::Reserved) {
            return Err(StoreError::IllegalSeatTransition {
                from: seat.status,
                to: SeatStatus::Reserved,
            });
        }
        seat.status = SeatStatus::Reserved;
        inner.items.entry(item.order_id).or_default().push(item.clone());
        Ok(())
    }

    async fn release_seat(&self, order_id: Uuid, seat_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        let items = inner
            .items
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        let position = items
            .iter()
            .position(|item| item.seat_id == seat_id)
            .ok_or(StoreError::ItemNotFound { order_id, seat_id })?;
        let seat = inner
            .seats
            .get_mut(&seat_id)
            .ok_or(StoreError::SeatNotFound(seat_id))?;
        if !seat.status.can_transition(SeatStatus::Available) {
            return Err(StoreError::IllegalSeatTransition {
                from: seat.status,
                to: SeatStatus::Available,
            });
        }
        seat.status = SeatStatus::Available;
        inner
            .items
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?
            .remove(position);
        Ok(())
    }

    async fn finalize(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        seats_to: SeatStatus,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = guard(&self.inner);
        let from = inner
            .orders
            .get(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?
            .status;
        if !from.can_transition(status) {
            return Err(StoreError::IllegalOrderTransition { from, to: status });
        }
        let seat_ids: Vec<Uuid> = inner
            .items
            .get(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?
            .iter()
            .map(|item| item.seat_id)
            .collect();
        // Validate every transition before applying any, so the batch is
        // all-or-nothing like the SQL transaction it stands in for.
        for seat_id in &seat_ids {
            let seat = inner
                .seats
                .get(seat_id)
                .ok_or(StoreError::SeatNotFound(*seat_id))?;
            if !seat.status.can_transition(seats_to) {
                return Err(StoreError::IllegalSeatTransition {
                    from: seat.status,
                    to: seats_to,
                });
            }
        }
        for seat_id in &seat_ids {
            if let Some(seat) = inner.seats.get_mut(seat_id) {
                seat.status = seats_to;
            }
        }
        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        order.status = status;
        if status == OrderStatus::Paid {
            order.paid_at = Some(Utc::now());
        }
        order.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn push(&self, notification: &Notification) -> Result<(), StoreError> {
        self.check_available()?;
        guard(&self.inner).notifications.push(notification.clone());
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>, StoreError> {
        self.check_available()?;
        Ok(guard(&self.inner)
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }
}
