//! Process-local job store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{JobPayload, JobRecord, JobStore, JobStoreError, new_job_id};

#[derive(Debug)]
struct Entry {
    raw: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`JobStore`]. Records are kept serialized, exactly as a remote
/// backend would hold them.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl_seconds: u64,
}

impl InMemoryJobStore {
    /// `ttl_seconds == 0` disables expiry.
    #[must_use]
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl_seconds,
        }
    }

    /// Periodically evict expired records. The task ends once the store is
    /// dropped.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let entries: Weak<RwLock<HashMap<String, Entry>>> = Arc::downgrade(&self.entries);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let evicted = purge(&entries).await;
                if evicted > 0 {
                    tracing::debug!(name: "jobs.reaper.evicted", evicted, "Evicted expired jobs");
                }
            }
        })
    }

    /// Evict expired records now; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        purge(&self.entries).await
    }

    /// Number of records held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, id: &str, raw: &str) {
        self.entries.write().await.insert(
            id.to_string(),
            Entry {
                raw: raw.to_string(),
                expires_at: None,
            },
        );
    }
}

async fn purge(entries: &RwLock<HashMap<String, Entry>>) -> usize {
    let now = Instant::now();
    let mut guard = entries.write().await;
    let before = guard.len();
    guard.retain(|_, e| !e.is_expired(now));
    before - guard.len()
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, payload: &JobPayload) -> Result<String, JobStoreError> {
        let id = new_job_id();
        let record = JobRecord {
            id: id.clone(),
            payload: payload.clone(),
            ttl_seconds: self.ttl_seconds,
        };
        let entry = Entry {
            raw: record.encode()?,
            expires_at: (self.ttl_seconds > 0)
                .then(|| Instant::now() + Duration::from_secs(self.ttl_seconds)),
        };
        self.entries.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<JobPayload>, JobStoreError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(id) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => {
                    return JobRecord::decode(id, &entry.raw).map(|r| Some(r.payload));
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(id);
        Ok(None)
    }

    async fn delete(&self, id: &str) -> Result<(), JobStoreError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fixtures::payload;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryJobStore::new(300);
        let id = store.put(&payload()).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), Some(payload()));
        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryJobStore::new(300);
        let id = store.put(&payload()).await.unwrap();
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        store.delete("never-existed").await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_job_is_not_found() {
        let store = InMemoryJobStore::new(5);
        let id = store.put(&payload()).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get(&id).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let store = InMemoryJobStore::new(0);
        let id = store.put(&payload()).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(store.get(&id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_abandoned_jobs() {
        let store = InMemoryJobStore::new(1);
        store.put(&payload()).await.unwrap();
        store.put(&payload()).await.unwrap();
        let reaper = store.spawn_reaper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.len().await, 0);
        reaper.abort();
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let store = InMemoryJobStore::new(300);
        store.insert_raw("bad", "{\"nope\":true}").await;
        assert!(matches!(
            store.get("bad").await,
            Err(JobStoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_do_not_interfere() {
        let store = InMemoryJobStore::new(300);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut p = payload();
                    p.prompt_id = format!("p-{i}");
                    let id = store.put(&p).await.unwrap();
                    let got = store.get(&id).await.unwrap().unwrap();
                    store.delete(&id).await.unwrap();
                    (p, got)
                })
            })
            .collect();

        for h in handles {
            let (sent, got) = h.await.unwrap();
            assert_eq!(sent, got);
        }
        assert!(store.is_empty().await);
    }
}
