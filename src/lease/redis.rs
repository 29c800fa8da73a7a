//! Redis backed lease store, enabled with the `redis-store` feature.

use std::{collections::BTreeSet, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures_retry::FutureRetry;
use redis::{aio::ConnectionManager, Client, RedisError};

use super::store::{Entry, LeaseStore};
use crate::{error::StoreError, util::retry::FixedCountWithDelayStrategy};

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const SCAN_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisLeaseStore {
    connection: ConnectionManager,
}

impl RedisLeaseStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| classify("connect", e))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| classify("connect", e))?;
        Ok(Self { connection })
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        FutureRetry::new(
            || {
                let attempt = call(self.connection.clone());
                async move { attempt.await.map_err(|e| classify(operation, e)) }
            },
            FixedCountWithDelayStrategy::new(MAX_ATTEMPTS, RETRY_DELAY),
        )
        .await
        .map(|(value, _attempts)| value)
        .map_err(|(e, _attempts)| e)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let millis = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = self
            .call("conditional_set", |mut conn| async move {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value).arg("PX").arg(millis);
                if only_if_absent {
                    cmd.arg("NX");
                }
                cmd.query_async(&mut conn).await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let (value, pttl): (Option<String>, i64) = self
            .call("get", |mut conn| async move {
                redis::pipe()
                    .cmd("GET")
                    .arg(key)
                    .cmd("PTTL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(value.map(|value| Entry {
            value,
            // -1 means no expiry; -2 means the key vanished between the two commands.
            expires_at: if pttl >= 0 {
                Some(Utc::now() + chrono::Duration::milliseconds(pttl))
            } else {
                None
            },
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self
            .call("delete", |mut conn| async move {
                redis::cmd("DEL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let _: i64 = self
            .call("add_to_set", |mut conn| async move {
                redis::cmd("SADD").arg(set).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let _: i64 = self
            .call("remove_from_set", |mut conn| async move {
                redis::cmd("SREM").arg(set).arg(member).query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let members: Vec<String> = self
            .call("members", |mut conn| async move {
                redis::cmd("SMEMBERS").arg(set).query_async(&mut conn).await
            })
            .await?;
        Ok(members.into_iter().collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .call("scan", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn classify(operation: &'static str, err: RedisError) -> StoreError {
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        StoreError::transient(operation, err)
    } else {
        StoreError::unavailable(operation, err)
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
