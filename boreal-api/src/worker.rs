use std::sync::Arc;

use tracing::info;

use boreal_core::queue::{IntakeConsumer, QueueError};
use boreal_order::{spawn_workers, FulfillmentWorker};
use boreal_store::app_config::QueueConfig;
use boreal_store::RedisQueue;

/// Start the fulfillment fleet: one consumer task per worker. Consumer ids
/// are stable across restarts so each worker first drains the pending list
/// its previous incarnation may have left behind.
pub async fn start_fleet(
    queue: &RedisQueue,
    worker: Arc<FulfillmentWorker>,
    config: &QueueConfig,
) -> Result<(), QueueError> {
    let fleet = config.workers_max.max(config.workers_min).max(1);
    let mut consumers: Vec<Box<dyn IntakeConsumer>> = Vec::with_capacity(fleet);
    for index in 0..fleet {
        let consumer_id = format!("worker-{}", index);
        queue.recover(&consumer_id).await?;
        consumers.push(Box::new(queue.consumer(&consumer_id)));
    }
    spawn_workers(worker, consumers);
    info!(workers = fleet, queue = %config.name, "fulfillment fleet started");
    Ok(())
}
