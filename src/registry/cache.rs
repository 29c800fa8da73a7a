use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ContainerRegistry, ManagedContainer, RegistryHealth};
use crate::{error::RegistryError, lease::ContainerId};

struct ContainerCache {
    cache: HashMap<ContainerId, ManagedContainer>,
    last_cache_update: Option<Instant>,
    cache_ttl: Duration,
}

impl ContainerCache {
    fn new(cache_ttl: Duration) -> Self {
        Self {
            cache: HashMap::new(),
            last_cache_update: None,
            cache_ttl,
        }
    }

    fn get_container(&self, id: &ContainerId) -> Option<ManagedContainer> {
        if self.cache_is_expired() {
            None
        } else {
            self.cache.get(id).cloned()
        }
    }

    fn get_all_containers(&self) -> Option<Vec<ManagedContainer>> {
        if self.cache_is_expired() {
            return None;
        }
        Some(self.cache.values().cloned().collect())
    }

    fn refresh(&mut self, containers: &[ManagedContainer]) {
        self.cache = containers
            .iter()
            .map(|container| (container.id.clone(), container.clone()))
            .collect();
        self.last_cache_update = Some(Instant::now());
    }

    fn cache_is_expired(&self) -> bool {
        if let Some(last_updated_time) = self.last_cache_update {
            last_updated_time + self.cache_ttl < Instant::now()
        } else {
            true
        }
    }
}

/// Serves managed-container lookups from a snapshot no older than `cache_ttl`.
///
/// Only hits are cached: a container missing from the snapshot is always
/// looked up in the underlying registry, so freshly created containers become
/// visible immediately.
pub struct CachedRegistry {
    inner: Arc<dyn ContainerRegistry>,
    cache: RwLock<ContainerCache>,
}

impl CachedRegistry {
    pub fn new(inner: Arc<dyn ContainerRegistry>, cache_ttl: Duration) -> Self {
        Self {
            inner,
            cache: RwLock::new(ContainerCache::new(cache_ttl)),
        }
    }

    pub async fn invalidate(&self) {
        self.cache.write().await.last_cache_update = None;
    }

    async fn refresh_cache(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        let containers = self.inner.list_managed().await?;
        self.cache.write().await.refresh(&containers);
        Ok(containers)
    }
}

#[async_trait]
impl ContainerRegistry for CachedRegistry {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        if let Some(containers) = self.cache.read().await.get_all_containers() {
            return Ok(containers);
        }
        self.refresh_cache().await
    }

    async fn get(&self, id: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError> {
        if let Some(container) = self.cache.read().await.get_container(id) {
            return Ok(Some(container));
        }
        self.inner.get(id).await
    }

    async fn ping(&self) -> Result<RegistryHealth, RegistryError> {
        self.inner.ping().await
    }
}
