use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::store::{Entry, LeaseStore};
use crate::error::StoreError;

struct Value {
    value: String,
    expires: Option<Instant>,
}

impl Value {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |expires| expires > now)
    }
}

#[derive(Default)]
struct Tables {
    values: HashMap<String, Value>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// Process-local lease store.
///
/// Good for tests and for a single coordinator instance. The availability and
/// latency knobs simulate a misbehaving backend.
#[derive(Default)]
pub struct MemoryLeaseStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    latency_millis: AtomicU64,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delays every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_millis
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Removes a key without touching any set, the way a TTL expiry would.
    pub async fn expire(&self, key: &str) {
        self.tables.lock().await.values.remove(key);
    }

    async fn enter(&self, operation: &'static str) -> Result<(), StoreError> {
        let latency = self.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        self.enter("conditional_set").await?;
        let now = Instant::now();
        let mut tables = self.tables.lock().await;
        if only_if_absent {
            if let Some(existing) = tables.values.get(key) {
                if existing.is_live(now) {
                    return Ok(false);
                }
            }
        }
        tables.values.insert(
            key.to_string(),
            Value {
                value: value.to_string(),
                // A TTL past what `Instant` can represent never expires.
                expires: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.enter("get").await?;
        let now = Instant::now();
        let mut tables = self.tables.lock().await;
        match tables.values.get(key) {
            Some(value) if value.is_live(now) => Ok(Some(Entry {
                value: value.value.clone(),
                expires_at: value.expires.map(|expires| {
                    Utc::now()
                        + chrono::Duration::from_std(expires - now)
                            .unwrap_or_else(|_| chrono::Duration::zero())
                }),
            })),
            Some(_) => {
                tables.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("delete").await?;
        let now = Instant::now();
        let removed = self.tables.lock().await.values.remove(key);
        Ok(removed.map_or(false, |value| value.is_live(now)))
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.enter("add_to_set").await?;
        self.tables
            .lock()
            .await
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.enter("remove_from_set").await?;
        let mut tables = self.tables.lock().await;
        if let Some(members) = tables.sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                tables.sets.remove(set);
            }
        }
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        self.enter("members").await?;
        Ok(self
            .tables
            .lock()
            .await
            .sets
            .get(set)
            .cloned()
            .unwrap_or_default())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.enter("scan").await?;
        let now = Instant::now();
        let mut tables = self.tables.lock().await;
        tables.values.retain(|_, value| value.is_live(now));
        Ok(tables
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
