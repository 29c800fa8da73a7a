use std::{collections::BTreeSet, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// A live value together with the moment the store will expire it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: String,
    /// `None` for values stored without a TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Key-value persistence with per-key expiry.
///
/// Every method is individually atomic. Expired keys must never be returned,
/// whether or not the backend has physically removed them yet.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Writes `value` under `key` with the given TTL. With `only_if_absent`
    /// the write only happens when no live value exists, and the return value
    /// says whether it did.
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    /// Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn members(&self, set: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Every live key starting with `prefix`, in no particular order.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Bounds a store round trip, turning a hung backend into a timeout error.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}
