//! Redis-backed job store.
//!
//! Records live under `relay:job:<id>` and expire through Redis itself, so
//! abandoned jobs need no reaper.

use redis::aio::ConnectionManager;

use super::{JobPayload, JobRecord, JobStore, JobStoreError, new_job_id};

const KEY_PREFIX: &str = "relay:job:";

impl From<redis::RedisError> for JobStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Connect to `redis_url`; the connection manager reconnects on its own.
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(name: "jobs.redis.connected", ttl_seconds, "Connected to Redis job store");
        Ok(Self { conn, ttl_seconds })
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, payload: &JobPayload) -> Result<String, JobStoreError> {
        let id = new_job_id();
        let raw = JobRecord {
            id: id.clone(),
            payload: payload.clone(),
            ttl_seconds: self.ttl_seconds,
        }
        .encode()?;

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::key(&id)).arg(raw);
        if self.ttl_seconds > 0 {
            cmd.arg("EX").arg(self.ttl_seconds);
        }
        let () = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<JobPayload>, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| JobRecord::decode(id, &raw).map(|r| r.payload))
            .transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let _removed: u64 = redis::cmd("DEL")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::payload;

    #[test]
    fn test_key_prefix() {
        assert_eq!(RedisJobStore::key("abc"), "relay:job:abc");
    }

    async fn store(ttl_seconds: u64) -> RedisJobStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisJobStore::connect(&url, ttl_seconds)
            .await
            .expect("Redis must be reachable at REDIS_URL")
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_put_get_delete_roundtrip() {
        let store = store(60).await;
        let job = payload();

        let id = store.put(&job).await.unwrap();
        let loaded = store.get(&id).await.unwrap().expect("job stored");
        assert_eq!(loaded.conversation_id, job.conversation_id);
        assert_eq!(loaded.request.prompt, job.request.prompt);
        assert_eq!(loaded.owner, job.owner);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_ttl_is_applied_to_key() {
        let mut conn = store(0).await.conn;

        let expiring = store(30).await;
        let id = expiring.put(&payload()).await.unwrap();
        let ttl: i64 = redis::cmd("TTL")
            .arg(RedisJobStore::key(&id))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!((1..=30).contains(&ttl), "ttl was {ttl}");

        let forever = store(0).await;
        let id2 = forever.put(&payload()).await.unwrap();
        let ttl: i64 = redis::cmd("TTL")
            .arg(RedisJobStore::key(&id2))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(ttl, -1);

        expiring.delete(&id).await.unwrap();
        forever.delete(&id2).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_corrupt_record_is_backend_error_not_missing() {
        let store = store(60).await;
        let mut conn = store.conn.clone();
        let () = redis::cmd("SET")
            .arg(RedisJobStore::key("garbled"))
            .arg("{not json")
            .arg("EX")
            .arg(60)
            .query_async(&mut conn)
            .await
            .unwrap();

        assert!(store.get("garbled").await.is_err());
        store.delete("garbled").await.unwrap();
    }
}
