use redis::Client as RedisClient;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

/// Best-effort notification fan-out. Inserts are synchronous and never fail
/// the operation that triggered them: an insert error is logged and
/// swallowed. After a successful insert the recipient's unread count is
/// published so open websockets update live.
pub struct NotificationService {
    redis: RedisClient,
}

pub fn channel_for(school_id: Uuid, recipient_id: Uuid) -> String {
    format!("school:{school_id}:notifications:{recipient_id}")
}

impl NotificationService {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    pub async fn notify(
        &self,
        pool: &PgPool,
        school_id: Uuid,
        recipient_id: Uuid,
        kind: &str,
        title: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) {
        let inserted = sqlx::query(
            "INSERT INTO notifications (school_id, recipient_id, kind, title, body, data)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(school_id)
        .bind(recipient_id)
        .bind(kind)
        .bind(title)
        .bind(body)
        .bind(data)
        .execute(pool)
        .await;

        if let Err(e) = inserted {
            tracing::warn!(
                recipient = %recipient_id,
                kind,
                error = %e,
                "Notification insert failed — dropped"
            );
            return;
        }

        self.publish_unread(pool, school_id, recipient_id).await;
    }

    pub async fn unread_count(&self, pool: &PgPool, recipient_id: Uuid) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = $1 AND is_read = FALSE",
        )
        .bind(recipient_id)
        .fetch_one(pool)
        .await
        .unwrap_or(0)
    }

    /// Push the current unread count onto the recipient's channel.
    /// Errors are swallowed: the badge refreshes on the next reconnect.
    pub async fn publish_unread(&self, pool: &PgPool, school_id: Uuid, recipient_id: Uuid) {
        let count = self.unread_count(pool, recipient_id).await;

        let mut conn = match self.redis.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "Redis unavailable for notification publish");
                return;
            }
        };

        let payload = json!({ "unread": count }).to_string();
        let published: Result<(), _> = redis::cmd("PUBLISH")
            .arg(channel_for(school_id, recipient_id))
            .arg(payload)
            .query_async(&mut conn)
            .await;

        if let Err(e) = published {
            tracing::debug!(error = %e, "Notification publish failed");
        }
    }
}
