use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boreal_api::state::AppState;
use boreal_core::repository::{NotificationRepository, OrderRepository, SeatRepository};
use boreal_order::{FulfillmentWorker, OrderManager, WorkerConfig};
use boreal_store::{
    Config, DbClient, PgNotificationRepository, PgOrderRepository, PgSeatRepository,
    RedisLockManager, RedisQueue,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "boreal_api=debug,boreal_order=debug,boreal_store=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!("starting boreal api on port {}", config.server.port);

    let db = DbClient::new(&config.database.url)
        .await
        .context("connecting to postgres")?;
    db.migrate().await.context("running migrations")?;

    let seats: Arc<dyn SeatRepository> = Arc::new(PgSeatRepository::new(db.pool.clone()));
    let orders: Arc<dyn OrderRepository> = Arc::new(PgOrderRepository::new(db.pool.clone()));
    let notifications: Arc<dyn NotificationRepository> =
        Arc::new(PgNotificationRepository::new(db.pool.clone()));

    let locks = Arc::new(
        RedisLockManager::new(&config.redis.url, config.lock.retry_interval())
            .context("opening redis lock client")?,
    );
    let queue = RedisQueue::new(&config.redis.url, &config.queue.name, config.queue.settings())
        .context("opening redis queue client")?;

    let worker = Arc::new(FulfillmentWorker::new(
        seats,
        orders.clone(),
        notifications.clone(),
        locks,
        WorkerConfig {
            lock_lease: config.lock.lease(),
            lock_acquire_timeout: config.lock.acquire_timeout(),
        },
    ));
    boreal_api::worker::start_fleet(&queue, worker, &config.queue)
        .await
        .context("starting fulfillment workers")?;

    let state = AppState {
        orders: Arc::new(OrderManager::new(orders)),
        intake: Arc::new(queue),
        notifications,
    };
    let app = boreal_api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding listener")?;
    axum::serve(listener, app).await.context("serving http")?;
    Ok(())
}
