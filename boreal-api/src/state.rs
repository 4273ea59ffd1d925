use std::sync::Arc;

use boreal_core::queue::IntakePublisher;
use boreal_core::repository::NotificationRepository;
use boreal_order::OrderManager;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderManager>,
    pub intake: Arc<dyn IntakePublisher>,
    pub notifications: Arc<dyn NotificationRepository>,
}
