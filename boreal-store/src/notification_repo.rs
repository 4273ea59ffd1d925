use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use boreal_core::repository::{Notification, NotificationRepository, StoreError};

pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    subject: String,
    body: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn push(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, subject, body, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(&notification.subject)
        .bind(&notification.body)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            "SELECT id, user_id, subject, body, created_at
             FROM notifications WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows
            .into_iter()
            .map(|row| Notification {
                id: row.id,
                user_id: row.user_id,
                subject: row.subject,
                body: row.body,
                created_at: row.created_at,
            })
            .collect())
    }
}
