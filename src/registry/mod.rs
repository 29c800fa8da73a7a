//! Read-only view of the containers the coordinator may hand out.

use std::fmt;

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::{error::RegistryError, lease::ContainerId};

pub mod cache;
pub mod docker;
pub mod memory;

pub use cache::CachedRegistry;
pub use docker::DockerRegistry;
pub use memory::MemoryRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    /// Anything else the runtime reports, kept verbatim.
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            other => ContainerState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Other(raw) => raw,
        }
    }

    /// The container will not come back on its own; its lease is dead weight.
    pub fn is_terminal(&self) -> bool {
        match self {
            ContainerState::Exited => true,
            ContainerState::Other(raw) => raw == "dead",
            ContainerState::Running => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContainerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub id: ContainerId,
    pub name: String,
    pub state: ContainerState,
    /// Whether the container carries this coordinator's group label.
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryHealth {
    pub server_version: String,
    pub containers: u64,
}

#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Every container in the administrative group, whatever its state.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError>;

    /// Looks up a single container. `Ok(None)` means it does not exist;
    /// unmanaged containers are returned with `managed == false`.
    async fn get(&self, id: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError>;

    async fn ping(&self) -> Result<RegistryHealth, RegistryError>;
}
