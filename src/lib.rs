use std::{sync::Arc, time::Duration};

use tracing::info;

use config::{LockConfig, StoreBackend};
use error::{CoordinatorError, StartupError};
use lease::{
    broker::LeaseBroker,
    coordinator::LockCoordinator,
    manager::LeaseManager,
    memory::MemoryLeaseStore,
    reaper::{Reaper, SweepOutcome},
    store::LeaseStore,
};
use registry::{CachedRegistry, ContainerRegistry, DockerRegistry};

pub mod config;
pub mod error;
pub mod gateway;
pub mod lease;
pub mod registry;
mod util;

pub use error::{ConfigError, RegistryError, StoreError};
pub use lease::{
    coordinator::{AcquireOutcome, InvalidInput, ReleaseOutcome},
    ContainerId, Lease, LeaseKey,
};

/// A coordinator plus the background reaper that keeps its leases honest.
pub struct LockService {
    coordinator: LockCoordinator,
    reaper: Arc<Reaper>,
    lease_manager: LeaseManager,
}

impl LockService {
    /// Opens the configured store, talks to docker for the registry and
    /// wires everything up. The reaper is not started until [`start`].
    ///
    /// [`start`]: LockService::start
    pub async fn build(config: &LockConfig) -> Result<Self, StartupError> {
        let store: Arc<dyn LeaseStore> = match &config.store {
            StoreBackend::Memory => Arc::new(MemoryLeaseStore::new()),
            StoreBackend::DynamoDb {
                table,
                region,
                endpoint,
            } => Arc::new(LeaseBroker::connect(
                table.clone(),
                region,
                endpoint.clone(),
            )?),
            StoreBackend::Redis { url } => open_redis(url).await?,
        };
        info!(store = ?config.store, ttl = ?config.lease_ttl, "opened lease store");

        let docker: Arc<dyn ContainerRegistry> = Arc::new(
            DockerRegistry::new(
                config.group_label.clone(),
                config.group.clone(),
                config.operation_timeout,
            )
            .with_binary(config.docker_binary.clone()),
        );
        Ok(Self::from_parts(store, docker, config))
    }

    /// Wires a service around an existing store and registry. Foreground
    /// calls see the registry through a short cache; the reaper does not.
    pub fn from_parts(
        store: Arc<dyn LeaseStore>,
        registry: Arc<dyn ContainerRegistry>,
        config: &LockConfig,
    ) -> Self {
        let cached: Arc<dyn ContainerRegistry> = Arc::new(CachedRegistry::new(
            registry.clone(),
            config.registry_cache_ttl,
        ));
        let coordinator = LockCoordinator::with_timeout(
            store,
            cached,
            config.lease_ttl,
            config.operation_timeout,
        );
        let reaper = Arc::new(Reaper::new(
            coordinator.clone(),
            registry,
            config.operation_timeout,
        ));
        let lease_manager = LeaseManager::new(reaper.clone(), config.reaper_interval);
        Self {
            coordinator,
            reaper,
            lease_manager,
        }
    }

    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub fn lease_ttl(&self) -> Duration {
        self.coordinator.lease_ttl()
    }

    /// One reaper sweep, outside the periodic schedule.
    pub async fn sweep_now(&self) -> Result<SweepOutcome, CoordinatorError> {
        self.reaper.sweep_now().await
    }

    /// Starts the periodic reaper. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.lease_manager.start();
    }

    pub fn is_running(&self) -> bool {
        self.lease_manager.is_running()
    }

    /// Stops the reaper. Leases stay in the store and expire on their own.
    pub async fn shutdown(&self) {
        self.lease_manager.shutdown().await;
        info!("lock service stopped");
    }
}

#[cfg(feature = "redis-store")]
async fn open_redis(url: &str) -> Result<Arc<dyn LeaseStore>, StartupError> {
    Ok(Arc::new(lease::redis::RedisLeaseStore::connect(url).await?))
}

#[cfg(not(feature = "redis-store"))]
async fn open_redis(_url: &str) -> Result<Arc<dyn LeaseStore>, StartupError> {
    Err(ConfigError::InvalidValue {
        key: "CONTAINER_LOCK_STORE".to_string(),
        message: "redis support requires the `redis-store` feature".to_string(),
    }
    .into())
}
