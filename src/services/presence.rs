use chrono::Utc;
use redis::Client as RedisClient;
use uuid::Uuid;

/// A member counts as online while their last heartbeat is within this
/// window. Clients beat roughly every 30 seconds.
const ONLINE_WINDOW_SECS: i64 = 90;

/// Managed presence lifecycle on a per-school Redis sorted set: connect
/// tracks, heartbeats re-score, disconnect untracks, and stale members age
/// out of the window. Injectable so the websocket layer can be tested
/// against a fake.
pub struct PresenceService {
    redis: RedisClient,
}

impl PresenceService {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn key(school_id: Uuid) -> String {
        format!("presence:{school_id}")
    }

    pub async fn track(&self, school_id: Uuid, profile_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("ZADD")
            .arg(Self::key(school_id))
            .arg(Utc::now().timestamp())
            .arg(profile_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// A heartbeat is just a re-track with a fresh score.
    pub async fn heartbeat(&self, school_id: Uuid, profile_id: Uuid) -> anyhow::Result<()> {
        self.track(school_id, profile_id).await
    }

    pub async fn untrack(&self, school_id: Uuid, profile_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("ZREM")
            .arg(Self::key(school_id))
            .arg(profile_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Members whose heartbeat falls inside the window. Stale entries are
    /// trimmed on the way.
    pub async fn online(&self, school_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let cutoff = Utc::now().timestamp() - ONLINE_WINDOW_SECS;

        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(Self::key(school_id))
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;

        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(Self::key(school_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }
}
