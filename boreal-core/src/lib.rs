pub mod intake;
pub mod lock;
pub mod memory;
pub mod order;
pub mod queue;
pub mod repository;
pub mod seat;

pub use intake::{IntakeItem, IntakeMessage, ValidationError};
pub use lock::{seat_lock_key, LockError, LockManager, LockToken};
pub use order::{Order, OrderItem, OrderStatus};
pub use queue::{
    DeadLetter, DeadLetterReason, Delivery, Envelope, IntakeConsumer, IntakePublisher, QueueError,
    QueueSettings,
};
pub use repository::{
    Notification, NotificationRepository, OrderRepository, SeatRepository, StoreError,
};
pub use seat::{CabinClass, Seat, SeatStatus};
