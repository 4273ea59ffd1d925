pub mod app_config;
pub mod database;
pub mod notification_repo;
pub mod order_repo;
pub mod redis_lock;
pub mod redis_queue;
pub mod seat_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use notification_repo::PgNotificationRepository;
pub use order_repo::PgOrderRepository;
pub use redis_lock::RedisLockManager;
pub use redis_queue::{RedisConsumer, RedisQueue};
pub use seat_repo::PgSeatRepository;
