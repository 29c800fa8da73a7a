use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ContainerRegistry, ContainerState, ManagedContainer, RegistryHealth};
use crate::{error::RegistryError, lease::ContainerId};

/// Registry backed by a map, for tests and for embedding the coordinator in
/// front of a runtime that pushes its inventory.
#[derive(Default)]
pub struct MemoryRegistry {
    containers: RwLock<BTreeMap<ContainerId, ManagedContainer>>,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, container: ManagedContainer) {
        self.containers
            .write()
            .await
            .insert(container.id.clone(), container);
    }

    /// Shorthand for a managed, running container named after its id.
    pub async fn insert_running(&self, id: &str) {
        self.insert(ManagedContainer {
            id: ContainerId::from(id),
            name: id.to_string(),
            state: ContainerState::Running,
            managed: true,
        })
        .await;
    }

    pub async fn set_state(&self, id: &ContainerId, state: ContainerState) -> bool {
        match self.containers.write().await.get_mut(id) {
            Some(container) => {
                container.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &ContainerId) -> Option<ManagedContainer> {
        self.containers.write().await.remove(id)
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable("registry offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRegistry for MemoryRegistry {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        self.check()?;
        Ok(self
            .containers
            .read()
            .await
            .values()
            .filter(|container| container.managed)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError> {
        self.check()?;
        Ok(self.containers.read().await.get(id).cloned())
    }

    async fn ping(&self) -> Result<RegistryHealth, RegistryError> {
        self.check()?;
        Ok(RegistryHealth {
            server_version: "memory".to_string(),
            containers: self.containers.read().await.len() as u64,
        })
    }
}
