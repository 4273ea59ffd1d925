use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use boreal_core::intake::{IntakeItem, IntakeMessage};
use boreal_core::order::{Order, OrderItem};
use boreal_core::repository::Notification;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders", post(submit_order).get(list_orders))
        .route("/v1/orders/{id}", get(get_order))
        .route("/v1/orders/{id}/pay", post(pay_order))
        .route("/v1/orders/{id}/cancel", post(cancel_order))
        .route("/v1/notifications", get(list_notifications))
}

/// Identity is established upstream; the gateway forwards the subject id.
fn caller(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let value = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing x-user-id header".to_string()))?;
    Uuid::parse_str(value)
        .map_err(|_| AppError::Unauthorized("malformed x-user-id header".to_string()))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    pub flight_id: Uuid,
    pub items: Vec<SubmitItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitItemRequest {
    pub seat_id: Uuid,
    pub passenger_name: String,
    pub passenger_document: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitOrderResponse {
    pub message_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: String,
    pub total_cents: i64,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            status: order.status.to_string(),
            total_cents: order.total_cents,
            created_at: order.created_at,
            paid_at: order.paid_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub seat_id: Uuid,
    pub passenger_name: String,
    pub price_cents: i64,
}

impl From<OrderItem> for OrderItemResponse {
    fn from(item: OrderItem) -> Self {
        Self {
            seat_id: item.seat_id,
            passenger_name: item.passenger_name,
            price_cents: item.price_cents,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<Notification> for NotificationResponse {
    fn from(note: Notification) -> Self {
        Self {
            id: note.id,
            subject: note.subject,
            body: note.body,
            created_at: note.created_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Fire-and-forget intake: the request is validated, queued and acknowledged
/// with 202. Fulfillment happens asynchronously; failures surface as
/// notifications.
async fn submit_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitOrderRequest>,
) -> Result<(StatusCode, Json<SubmitOrderResponse>), AppError> {
    let user_id = caller(&headers)?;
    let items = req
        .items
        .into_iter()
        .map(|item| IntakeItem {
            seat_id: item.seat_id,
            passenger_name: item.passenger_name,
            passenger_document: item.passenger_document,
        })
        .collect();
    let message = IntakeMessage::new(user_id, req.flight_id, items);
    // Reject obviously malformed requests before they reach the queue; the
    // worker revalidates on receipt.
    message.validate()?;

    state.intake.publish(&message).await?;
    tracing::info!(
        message_id = %message.message_id,
        user_id = %user_id,
        seats = message.items.len(),
        "intake message accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitOrderResponse {
            message_id: message.message_id,
        }),
    ))
}

async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrderResponse>>, AppError> {
    let user_id = caller(&headers)?;
    let orders = state.orders.list_orders(user_id).await?;
    Ok(Json(orders.into_iter().map(Into::into).collect()))
}

async fn get_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderDetailResponse>, AppError> {
    let user_id = caller(&headers)?;
    let (order, items) = state.orders.get_order(order_id, user_id).await?;
    Ok(Json(OrderDetailResponse {
        order: order.into(),
        items: items.into_iter().map(Into::into).collect(),
    }))
}

async fn pay_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let user_id = caller(&headers)?;
    let order = state.orders.pay(order_id, user_id).await?;
    Ok(Json(order.into()))
}

async fn cancel_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let user_id = caller(&headers)?;
    let order = state.orders.cancel(order_id, user_id).await?;
    Ok(Json(order.into()))
}

async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<NotificationResponse>>, AppError> {
    let user_id = caller(&headers)?;
    let notes = state.notifications.list_for_user(user_id).await?;
    Ok(Json(notes.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use boreal_core::memory::{MemoryQueue, MemoryStore};
    use boreal_core::queue::QueueSettings;
    use boreal_core::repository::{OrderRepository, SeatRepository};
    use boreal_core::seat::{CabinClass, Seat, SeatStatus};
    use boreal_order::OrderManager;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: MemoryQueue,
        app: axum::Router,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = MemoryQueue::new(
            "order.intake",
            QueueSettings {
                durable: false,
                message_ttl: None,
                max_length: 10,
                max_deliveries: 3,
                prefetch: 5,
            },
        );
        let state = AppState {
            orders: Arc::new(OrderManager::new(store.clone())),
            intake: Arc::new(queue.clone()),
            notifications: store.clone(),
        };
        Fixture {
            store,
            queue: queue.clone(),
            app: crate::app(state),
        }
    }

    fn post_json(uri: &str, user: Option<Uuid>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user.to_string());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, user: Uuid) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("x-user-id", user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn booked_order(store: &Arc<MemoryStore>, user_id: Uuid) -> (Order, Seat) {
        let seat = Seat::new(Uuid::new_v4(), "8C", CabinClass::Economy, 20_000);
        store.insert(&seat).await.unwrap();
        let order = Order::new(user_id, Uuid::new_v4(), seat.price_cents);
        store.create_order(&order).await.unwrap();
        let item = OrderItem::new(order.id, seat.id, "Ada", "P1", seat.price_cents);
        store.reserve_seat(&item).await.unwrap();
        (order, seat)
    }

    #[tokio::test]
    async fn test_submit_order_is_accepted_and_queued() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let body = serde_json::json!({
            "flight_id": Uuid::new_v4(),
            "items": [{
                "seat_id": Uuid::new_v4(),
                "passenger_name": "Ada Lovelace",
                "passenger_document": "P1234567",
            }],
        });

        let response = fx
            .app
            .oneshot(post_json("/v1/orders", Some(user), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert!(json["message_id"].as_str().is_some());
        assert_eq!(fx.queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_submit_order_without_identity_is_unauthorized() {
        let fx = fixture();
        let body = serde_json::json!({
            "flight_id": Uuid::new_v4(),
            "items": [{
                "seat_id": Uuid::new_v4(),
                "passenger_name": "Ada",
                "passenger_document": "P1",
            }],
        });

        let response = fx
            .app
            .oneshot(post_json("/v1/orders", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(fx.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_submit_order_with_no_items_is_rejected() {
        let fx = fixture();
        let body = serde_json::json!({ "flight_id": Uuid::new_v4(), "items": [] });

        let response = fx
            .app
            .oneshot(post_json("/v1/orders", Some(Uuid::new_v4()), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(fx.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_submit_order_when_queue_is_full_is_unavailable() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let item = serde_json::json!({
            "seat_id": Uuid::new_v4(),
            "passenger_name": "Ada",
            "passenger_document": "P1",
        });
        for _ in 0..10 {
            let body = serde_json::json!({ "flight_id": Uuid::new_v4(), "items": [item.clone()] });
            let response = fx
                .app
                .clone()
                .oneshot(post_json("/v1/orders", Some(user), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let body = serde_json::json!({ "flight_id": Uuid::new_v4(), "items": [item] });
        let response = fx
            .app
            .oneshot(post_json("/v1/orders", Some(user), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_pay_order_occupies_seats() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let (order, seat) = booked_order(&fx.store, user).await;

        let response = fx
            .app
            .oneshot(post_json(
                &format!("/v1/orders/{}/pay", order.id),
                Some(user),
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "PAID");
        assert_eq!(
            SeatRepository::get(&*fx.store, seat.id)
                .await
                .unwrap()
                .unwrap()
                .status,
            SeatStatus::Occupied
        );
    }

    #[tokio::test]
    async fn test_cancel_after_pay_conflicts() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let (order, _) = booked_order(&fx.store, user).await;
        let uri_pay = format!("/v1/orders/{}/pay", order.id);
        let uri_cancel = format!("/v1/orders/{}/cancel", order.id);

        let response = fx
            .app
            .clone()
            .oneshot(post_json(&uri_pay, Some(user), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = fx
            .app
            .oneshot(post_json(&uri_cancel, Some(user), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_foreign_order_reads_as_not_found() {
        let fx = fixture();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let (order, _) = booked_order(&fx.store, owner).await;

        let response = fx
            .app
            .oneshot(get_req(&format!("/v1/orders/{}", order.id), stranger))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_orders_scopes_to_caller() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        booked_order(&fx.store, user).await;
        booked_order(&fx.store, other).await;

        let response = fx
            .app
            .oneshot(get_req("/v1/orders", user))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }
}
