use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use boreal_core::order::{Order, OrderItem, OrderStatus};
use boreal_core::repository::{OrderRepository, StoreError};
use boreal_core::seat::SeatStatus;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("order not found: {0}")]
    NotFound(Uuid),
    #[error("order {0} does not belong to the requesting user")]
    NotOwner(Uuid),
    #[error("order is {from}; only {required} orders allow this operation")]
    WrongState { from: OrderStatus, required: OrderStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owner-scoped order lifecycle outside the intake pipeline: payment
/// confirmation and cancellation. Both observe the same state machines the
/// worker enforces. Seats referenced by a PENDING order are RESERVED and
/// only reachable through that order, so the transactional batch transition
/// is the required atomicity; no seat lease is involved past reservation.
pub struct OrderManager {
    orders: Arc<dyn OrderRepository>,
}

impl OrderManager {
    pub fn new(orders: Arc<dyn OrderRepository>) -> Self {
        Self { orders }
    }

    pub async fn get_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Order, Vec<OrderItem>), OrderError> {
        let (order, items) = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        if order.user_id != user_id {
            return Err(OrderError::NotOwner(order_id));
        }
        Ok((order, items))
    }

    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>, OrderError> {
        Ok(self.orders.list_for_user(user_id).await?)
    }

    /// PENDING -> PAID; every reserved seat becomes OCCUPIED. One commit:
    /// the order must never read PAID while its seats are still RESERVED.
    pub async fn pay(&self, order_id: Uuid, user_id: Uuid) -> Result<Order, OrderError> {
        let (order, _) = self.require_pending(order_id, user_id).await?;
        self.orders
            .finalize(order.id, OrderStatus::Paid, SeatStatus::Occupied)
            .await?;
        info!(order_id = %order.id, order_number = %order.order_number, "order paid");
        self.refetch(order_id).await
    }

    /// PENDING -> CANCELLED; every reserved seat goes back on sale in the
    /// same commit, so a failure leaves the order PENDING and retryable
    /// rather than CANCELLED with its seats stranded. Items are kept for
    /// history; only the seats are freed.
    pub async fn cancel(&self, order_id: Uuid, user_id: Uuid) -> Result<Order, OrderError> {
        let (order, _) = self.require_pending(order_id, user_id).await?;
        self.orders
            .finalize(order.id, OrderStatus::Cancelled, SeatStatus::Available)
            .await?;
        info!(order_id = %order.id, order_number = %order.order_number, "order cancelled");
        self.refetch(order_id).await
    }

    async fn require_pending(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Order, Vec<OrderItem>), OrderError> {
        let (order, items) = self.get_order(order_id, user_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(OrderError::WrongState {
                from: order.status,
                required: OrderStatus::Pending,
            });
        }
        Ok((order, items))
    }

    async fn refetch(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let (order, _) = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        Ok(order)
    }
}
