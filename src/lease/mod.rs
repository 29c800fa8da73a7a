use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod broker;
pub mod coordinator;
pub(crate) mod manager;
pub mod memory;
pub mod reaper;
#[cfg(feature = "redis-store")]
pub mod redis;
mod stripes;
pub mod store;

#[cfg(test)]
mod coordinator_test;

/// Store key prefix of every lease record.
pub(crate) const LEASE_PREFIX: &str = "lock:";

/// Store set that mirrors the containers under a live lease.
pub(crate) const ACTIVE_SET: &str = "active_containers";

/// Separates the container id from the writer's token in a lease record.
const TOKEN_SEPARATOR: char = '#';

/// Client identity a lease is granted to, in practice the client's IP address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseKey(String);

/// Opaque container identifier as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub(crate) fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(LeaseKey);
string_id!(ContainerId);

impl LeaseKey {
    pub(crate) fn store_key(&self) -> String {
        format!("{}{}", LEASE_PREFIX, self.0)
    }

    pub(crate) fn from_store_key(store_key: &str) -> Option<Self> {
        store_key
            .strip_prefix(LEASE_PREFIX)
            .filter(|key| !key.is_empty())
            .map(LeaseKey::from)
    }
}

/// A time-bounded exclusive binding between a client and a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub key: LeaseKey,
    pub container: ContainerId,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Random value written by the acquiring coordinator, so it can recognise
    /// its own record after an ambiguous write.
    #[serde(skip)]
    pub(crate) token: Option<String>,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono_ttl(self.ttl)
    }

    /// Rebuilds a lease from a store entry. Stores only remember when the
    /// record expires, so the acquisition time is derived from the fixed TTL.
    pub(crate) fn from_entry(key: LeaseKey, entry: store::Entry, ttl: Duration) -> Self {
        let acquired_at = match entry.expires_at {
            Some(expires_at) => expires_at - chrono_ttl(ttl),
            None => Utc::now(),
        };
        let (container, token) = split_record(entry.value);
        Self {
            key,
            container,
            acquired_at,
            ttl,
            token,
        }
    }
}

pub(crate) fn new_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Store value of a lease record: `{container}#{token}`.
pub(crate) fn record_value(container: &ContainerId, token: &str) -> String {
    format!("{}{}{}", container, TOKEN_SEPARATOR, token)
}

/// Records written without a token carry only the container id.
fn split_record(value: String) -> (ContainerId, Option<String>) {
    match value.rsplit_once(TOKEN_SEPARATOR) {
        Some((container, token)) if !container.is_empty() => {
            (ContainerId::from(container), Some(token.to_string()))
        }
        _ => (ContainerId::from(value), None),
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}
