use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle status. PENDING is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    /// PENDING -> PAID and PENDING -> CANCELLED, both terminal. Refund and
    /// rebooking flows are out of scope, so nothing leaves PAID or CANCELLED.
    pub fn can_transition(self, to: OrderStatus) -> bool {
        matches!(
            (self, to),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// One purchase intent by one user. `intake_message_id` records the queue
/// message that produced the order and lets the worker short-circuit
/// duplicate deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub intake_message_id: Uuid,
    pub total_cents: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(user_id: Uuid, intake_message_id: Uuid, total_cents: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_number: generate_order_number(),
            user_id,
            intake_message_id,
            total_cents,
            status: OrderStatus::Pending,
            created_at: now,
            paid_at: None,
            updated_at: now,
        }
    }
}

/// One seat-assignment line within an order. Created atomically with its
/// seat's RESERVED transition; immutable afterwards except through the
/// rollback path that also frees the seat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub seat_id: Uuid,
    pub passenger_name: String,
    pub passenger_document: String,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    pub fn new(
        order_id: Uuid,
        seat_id: Uuid,
        passenger_name: &str,
        passenger_document: &str,
        price_cents: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            seat_id,
            passenger_name: passenger_name.to_string(),
            passenger_document: passenger_document.to_string(),
            price_cents,
            created_at: Utc::now(),
        }
    }
}

/// Format: ORD + yyyyMMddHHmmss + 6 uppercase hex chars.
pub fn generate_order_number() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("ORD{}{}", stamp, suffix)
}
