//! Process-wide configuration.
//!
//! Everything is read from `CONTAINER_LOCK_*` environment variables and falls
//! back to the reference values in [`LockConfig::default`].

use std::{env, str::FromStr, time::Duration};

use crate::error::ConfigError;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REGISTRY_CACHE_TTL: Duration = Duration::from_secs(5);
/// Longest lease the coordinator will hand out.
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Which lease store backend to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store. Only safe for a single coordinator instance.
    Memory,
    DynamoDb {
        table: String,
        region: String,
        /// Overrides the regional endpoint, e.g. for dynamodb-local.
        endpoint: Option<String>,
    },
    Redis {
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub store: StoreBackend,
    /// Lifetime of every lease.
    pub lease_ttl: Duration,
    /// Docker label that marks a container as managed.
    pub group_label: String,
    /// Required value of `group_label`.
    pub group: String,
    pub docker_binary: String,
    pub reaper_interval: Duration,
    /// Upper bound for any single store or registry round trip.
    pub operation_timeout: Duration,
    pub registry_cache_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            lease_ttl: DEFAULT_LEASE_TTL,
            group_label: "sablier.group".to_string(),
            group: "qemu-lab".to_string(),
            docker_binary: "docker".to_string(),
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            registry_cache_ttl: DEFAULT_REGISTRY_CACHE_TTL,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(key.to_string())),
        })
    }

    /// Builds a config from an arbitrary key lookup. `from_env` is this over
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<Option<String>, ConfigError>,
    {
        let vars = Vars { lookup };
        let defaults = Self::default();

        let store = match vars
            .string("CONTAINER_LOCK_STORE", "memory")?
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "dynamodb" | "dynamo" => StoreBackend::DynamoDb {
                table: vars.string("CONTAINER_LOCK_DYNAMO_TABLE", "container_locks")?,
                region: vars.string("CONTAINER_LOCK_DYNAMO_REGION", "us-east-1")?,
                endpoint: vars.optional("CONTAINER_LOCK_DYNAMO_ENDPOINT")?,
            },
            "redis" => StoreBackend::Redis {
                url: vars.string("CONTAINER_LOCK_REDIS_URL", "redis://redis:6379/0")?,
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "CONTAINER_LOCK_STORE".to_string(),
                    message: format!("unknown backend '{}'", other),
                })
            }
        };

        let config = Self {
            store,
            lease_ttl: vars.seconds("CONTAINER_LOCK_TTL_SECS", defaults.lease_ttl)?,
            group_label: vars.string("CONTAINER_LOCK_GROUP_LABEL", &defaults.group_label)?,
            group: vars.string("CONTAINER_LOCK_GROUP", &defaults.group)?,
            docker_binary: vars.string("CONTAINER_LOCK_DOCKER_BIN", &defaults.docker_binary)?,
            reaper_interval: vars
                .seconds("CONTAINER_LOCK_REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
            operation_timeout: vars
                .millis("CONTAINER_LOCK_OP_TIMEOUT_MS", defaults.operation_timeout)?,
            registry_cache_ttl: vars
                .seconds("CONTAINER_LOCK_REGISTRY_CACHE_SECS", defaults.registry_cache_ttl)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl.is_zero() {
            return Err(invalid("CONTAINER_LOCK_TTL_SECS", "must be positive"));
        }
        if self.lease_ttl > MAX_LEASE_TTL {
            return Err(invalid("CONTAINER_LOCK_TTL_SECS", "must not exceed one day"));
        }
        if self.reaper_interval.is_zero() {
            return Err(invalid(
                "CONTAINER_LOCK_REAPER_INTERVAL_SECS",
                "must be positive",
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(invalid("CONTAINER_LOCK_OP_TIMEOUT_MS", "must be positive"));
        }
        // A managed check may be stale for at most one reconciliation interval.
        if self.registry_cache_ttl > self.reaper_interval {
            return Err(invalid(
                "CONTAINER_LOCK_REGISTRY_CACHE_SECS",
                "must not exceed the reaper interval",
            ));
        }
        if self.group_label.trim().is_empty() || self.group.trim().is_empty() {
            return Err(invalid("CONTAINER_LOCK_GROUP", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Result<Option<String>, ConfigError>,
{
    fn optional(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok((self.lookup)(key)?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    fn string(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.optional(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e: T::Err| invalid(key, &format!("'{}': {}", raw, e))),
            None => Ok(None),
        }
    }

    fn seconds(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }
}
