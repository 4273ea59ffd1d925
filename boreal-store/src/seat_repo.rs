use std::str::FromStr;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use boreal_core::repository::{SeatRepository, StoreError};
use boreal_core::seat::{CabinClass, Seat, SeatStatus};

pub struct PgSeatRepository {
    pool: PgPool,
}

impl PgSeatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SeatRow {
    id: Uuid,
    flight_id: Uuid,
    seat_number: String,
    cabin_class: String,
    price_cents: i64,
    status: String,
}

impl SeatRow {
    fn into_seat(self) -> Result<Seat, StoreError> {
        Ok(Seat {
            id: self.id,
            flight_id: self.flight_id,
            seat_number: self.seat_number,
            cabin_class: CabinClass::from_str(&self.cabin_class).map_err(StoreError::Corrupt)?,
            price_cents: self.price_cents,
            status: SeatStatus::from_str(&self.status).map_err(StoreError::Corrupt)?,
        })
    }
}

#[async_trait]
impl SeatRepository for PgSeatRepository {
    async fn get(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        let row: Option<SeatRow> = sqlx::query_as(
            "SELECT id, flight_id, seat_number, cabin_class, price_cents, status
             FROM seats WHERE id = $1",
        )
        .bind(seat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        row.map(SeatRow::into_seat).transpose()
    }

    async fn insert(&self, seat: &Seat) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO seats (id, flight_id, seat_number, cabin_class, price_cents, status)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(seat.id)
        .bind(seat.flight_id)
        .bind(&seat.seat_number)
        .bind(seat.cabin_class.as_str())
        .bind(seat.price_cents)
        .bind(seat.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn set_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM seats WHERE id = $1 FOR UPDATE")
                .bind(seat_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        let (current,) = current.ok_or(StoreError::SeatNotFound(seat_id))?;
        let from = SeatStatus::from_str(&current).map_err(StoreError::Corrupt)?;
        if !from.can_transition(status) {
            return Err(StoreError::IllegalSeatTransition { from, to: status });
        }

        sqlx::query("UPDATE seats SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(seat_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }
}
