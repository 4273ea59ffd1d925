pub mod manager;
pub mod worker;

pub use manager::{OrderError, OrderManager};
pub use worker::{run_consumer, spawn_workers, FulfillmentWorker, Outcome, WorkerConfig};
