use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order::{Order, OrderItem, OrderStatus};
use crate::seat::{Seat, SeatStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("seat not found: {0}")]
    SeatNotFound(Uuid),
    #[error("order not found: {0}")]
    OrderNotFound(Uuid),
    #[error("no order item for order {order_id} and seat {seat_id}")]
    ItemNotFound { order_id: Uuid, seat_id: Uuid },
    #[error("illegal seat transition {from} -> {to}")]
    IllegalSeatTransition { from: SeatStatus, to: SeatStatus },
    #[error("illegal order transition {from} -> {to}")]
    IllegalOrderTransition { from: OrderStatus, to: OrderStatus },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage backend unavailable: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }

    /// Transient errors map to nack-with-requeue in the pipeline; everything
    /// else is permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

#[async_trait]
pub trait SeatRepository: Send + Sync {
    async fn get(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError>;

    async fn insert(&self, seat: &Seat) -> Result<(), StoreError>;

    /// Single-seat status write. Callers mutating AVAILABLE seats must hold
    /// the seat's lock; the repository only enforces transition legality.
    async fn set_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(), StoreError>;
}

/// Orders and their seat-assignment lines. The combined operations
/// (`reserve_seat`, `release_seat`, `finalize`) are transactional:
/// the seat flip and the item write commit together or not at all.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_order(&self, order_id: Uuid)
        -> Result<Option<(Order, Vec<OrderItem>)>, StoreError>;

    async fn find_by_message_id(&self, message_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError>;

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError>;

    /// Insert the item and flip its seat AVAILABLE -> RESERVED in one
    /// commit. Fails with `IllegalSeatTransition` when the seat is no
    /// longer available.
    async fn reserve_seat(&self, item: &OrderItem) -> Result<(), StoreError>;

    /// Rollback primitive: remove the item and flip the seat back to
    /// AVAILABLE in one commit.
    async fn release_seat(&self, order_id: Uuid, seat_id: Uuid) -> Result<(), StoreError>;

    /// Terminal transition: move the order to `status` and every seat it
    /// references to `seats_to` in one commit, keeping the items. Used by
    /// payment (PAID / OCCUPIED) and cancellation (CANCELLED / AVAILABLE).
    /// A single commit is required: a failure in between must never leave
    /// a terminal order whose seats still carry the old status.
    async fn finalize(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        seats_to: SeatStatus,
    ) -> Result<(), StoreError>;
}

/// Out-of-band side channel for business failures: intake is fire-and-forget
/// at submission time, so the requester learns about a failed booking from a
/// notification record, not a synchronous response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subject: subject.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn push(&self, notification: &Notification) -> Result<(), StoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>, StoreError>;
}
