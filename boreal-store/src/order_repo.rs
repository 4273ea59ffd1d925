use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use boreal_core::order::{Order, OrderItem, OrderStatus};
use boreal_core::repository::{OrderRepository, StoreError};
use boreal_core::seat::SeatStatus;

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: Uuid,
    intake_message_id: Uuid,
    total_cents: i64,
    status: String,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self) -> Result<Order, StoreError> {
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            user_id: self.user_id,
            intake_message_id: self.intake_message_id,
            total_cents: self.total_cents,
            status: OrderStatus::from_str(&self.status).map_err(StoreError::Corrupt)?,
            created_at: self.created_at,
            paid_at: self.paid_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    seat_id: Uuid,
    passenger_name: String,
    passenger_document: String,
    price_cents: i64,
    created_at: DateTime<Utc>,
}

impl OrderItemRow {
    fn into_item(self) -> OrderItem {
        OrderItem {
            id: self.id,
            order_id: self.order_id,
            seat_id: self.seat_id,
            passenger_name: self.passenger_name,
            passenger_document: self.passenger_document,
            price_cents: self.price_cents,
            created_at: self.created_at,
        }
    }
}

const ORDER_COLUMNS: &str = "id, order_number, user_id, intake_message_id, total_cents, status, \
                             created_at, paid_at, updated_at";

async fn seat_status_for_update(
    tx: &mut Transaction<'_, Postgres>,
    seat_id: Uuid,
) -> Result<SeatStatus, StoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM seats WHERE id = $1 FOR UPDATE")
        .bind(seat_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::backend)?;
    let (status,) = row.ok_or(StoreError::SeatNotFound(seat_id))?;
    SeatStatus::from_str(&status).map_err(StoreError::Corrupt)
}

async fn order_exists(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
) -> Result<bool, StoreError> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::backend)?;
    Ok(row.is_some())
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO orders (id, order_number, user_id, intake_message_id, total_cents, status,
                                 created_at, paid_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(order.id)
        .bind(&order.order_number)
        .bind(order.user_id)
        .bind(order.intake_message_id)
        .bind(order.total_cents)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.paid_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(Order, Vec<OrderItem>)>, StoreError> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order = row.into_order()?;

        let items: Vec<OrderItemRow> = sqlx::query_as(
            "SELECT id, order_id, seat_id, passenger_name, passenger_document, price_cents,
                    created_at
             FROM order_items WHERE order_id = $1 ORDER BY created_at",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(Some((
            order,
            items.into_iter().map(OrderItemRow::into_item).collect(),
        )))
    }

    async fn find_by_message_id(&self, message_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE intake_message_id = $1
             ORDER BY created_at DESC LIMIT 1",
            ORDER_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        row.map(OrderRow::into_order).transpose()
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE user_id = $1 ORDER BY created_at DESC",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.into_iter().map(OrderRow::into_order).collect()
    }

    async fn update_status(&self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        let (current,) = current.ok_or(StoreError::OrderNotFound(order_id))?;
        let from = OrderStatus::from_str(&current).map_err(StoreError::Corrupt)?;
        if !from.can_transition(status) {
            return Err(StoreError::IllegalOrderTransition { from, to: status });
        }

        if status == OrderStatus::Paid {
            sqlx::query(
                "UPDATE orders SET status = $1, paid_at = NOW(), updated_at = NOW() WHERE id = $2",
            )
            .bind(status.as_str())
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        } else {
            sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(order_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }

    async fn reserve_seat(&self, item: &OrderItem) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        if !order_exists(&mut tx, item.order_id).await? {
            return Err(StoreError::OrderNotFound(item.order_id));
        }
        let from = seat_status_for_update(&mut tx, item.seat_id).await?;
        if !from.can_transition(SeatStatus::Reserved) {
            return Err(StoreError::IllegalSeatTransition {
                from,
                to: SeatStatus::Reserved,
            });
        }

        sqlx::query("UPDATE seats SET status = $1 WHERE id = $2")
            .bind(SeatStatus::Reserved.as_str())
            .bind(item.seat_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        sqlx::query(
            "INSERT INTO order_items (id, order_id, seat_id, passenger_name, passenger_document,
                                      price_cents, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(item.id)
        .bind(item.order_id)
        .bind(item.seat_id)
        .bind(&item.passenger_name)
        .bind(&item.passenger_document)
        .bind(item.price_cents)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }

    async fn release_seat(&self, order_id: Uuid, seat_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let item: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM order_items WHERE order_id = $1 AND seat_id = $2")
                .bind(order_id)
                .bind(seat_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        let Some((item_id,)) = item else {
            if order_exists(&mut tx, order_id).await? {
                return Err(StoreError::ItemNotFound { order_id, seat_id });
            }
            return Err(StoreError::OrderNotFound(order_id));
        };

        let from = seat_status_for_update(&mut tx, seat_id).await?;
        if !from.can_transition(SeatStatus::Available) {
            return Err(StoreError::IllegalSeatTransition {
                from,
                to: SeatStatus::Available,
            });
        }

        sqlx::query("UPDATE seats SET status = $1 WHERE id = $2")
            .bind(SeatStatus::Available.as_str())
            .bind(seat_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        sqlx::query("DELETE FROM order_items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }

    async fn finalize(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        seats_to: SeatStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        let (current,) = current.ok_or(StoreError::OrderNotFound(order_id))?;
        let from = OrderStatus::from_str(&current).map_err(StoreError::Corrupt)?;
        if !from.can_transition(status) {
            return Err(StoreError::IllegalOrderTransition { from, to: status });
        }

        let seats: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT s.id, s.status FROM seats s
             JOIN order_items oi ON oi.seat_id = s.id
             WHERE oi.order_id = $1
             FOR UPDATE OF s",
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        // Validate every transition before writing any, so the batch commits
        // all-or-nothing.
        for (_, seat_status) in &seats {
            let seat_from = SeatStatus::from_str(seat_status).map_err(StoreError::Corrupt)?;
            if !seat_from.can_transition(seats_to) {
                return Err(StoreError::IllegalSeatTransition {
                    from: seat_from,
                    to: seats_to,
                });
            }
        }
        for (seat_id, _) in &seats {
            sqlx::query("UPDATE seats SET status = $1 WHERE id = $2")
                .bind(seats_to.as_str())
                .bind(seat_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }

        if status == OrderStatus::Paid {
            sqlx::query(
                "UPDATE orders SET status = $1, paid_at = NOW(), updated_at = NOW() WHERE id = $2",
            )
            .bind(status.as_str())
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        } else {
            sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(order_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }
}
