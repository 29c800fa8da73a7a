//! Container registry backed by the `docker` CLI.
//!
//! The binary inherits `DOCKER_HOST`, `DOCKER_TLS_VERIFY` and
//! `DOCKER_CERT_PATH` from the environment, so remote daemons work without
//! any extra plumbing here.

use std::{collections::HashMap, process::Output, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ContainerRegistry, ContainerState, ManagedContainer, RegistryHealth};
use crate::{error::RegistryError, lease::ContainerId};

#[derive(Debug, Clone)]
pub struct DockerRegistry {
    binary: String,
    group_label: String,
    group: String,
    timeout: Duration,
}

impl DockerRegistry {
    pub fn new(group_label: impl Into<String>, group: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: "docker".to_string(),
            group_label: group_label.into(),
            group: group.into(),
            timeout,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RegistryError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(%command, "running registry command");
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RegistryError::Unavailable(format!("{}: {}", command, e))),
            Err(_) => Err(RegistryError::Timeout {
                command,
                after: self.timeout,
            }),
        }
    }

    fn failed(&self, args: &[&str], output: &Output) -> RegistryError {
        RegistryError::CommandFailed {
            command: format!("{} {}", self.binary, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code(),
        }
    }
}

#[async_trait]
impl ContainerRegistry for DockerRegistry {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        let filter = format!("label={}={}", self.group_label, self.group);
        let args = [
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            filter.as_str(),
            "--format",
            "{{json .}}",
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failed(&args, &output));
        }
        let mut containers = parse_ps_lines(&String::from_utf8_lossy(&output.stdout))?;
        // The filter already applied, but `ps` only reports a label string.
        for container in containers.iter_mut() {
            container.managed = true;
        }
        Ok(containers)
    }

    async fn get(&self, id: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError> {
        let args = [
            "inspect",
            "--type",
            "container",
            "--format",
            "{{json .}}",
            id.as_str(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") || stderr.contains("No such object") {
                return Ok(None);
            }
            return Err(self.failed(&args, &output));
        }
        parse_inspect(
            &String::from_utf8_lossy(&output.stdout),
            &self.group_label,
            &self.group,
        )
        .map(Some)
    }

    async fn ping(&self) -> Result<RegistryHealth, RegistryError> {
        let args = ["info", "--format", "{{json .}}"];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failed(&args, &output));
        }
        let info: DockerInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| RegistryError::Malformed(format!("docker info: {}", e)))?;
        Ok(RegistryHealth {
            server_version: info.server_version,
            containers: info.containers,
        })
    }
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: Option<String>,
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Deserialize)]
struct Inspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize, Default)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct DockerInfo {
    #[serde(rename = "ServerVersion", default)]
    server_version: String,
    #[serde(rename = "Containers", default)]
    containers: u64,
}

fn parse_ps_lines(stdout: &str) -> Result<Vec<ManagedContainer>, RegistryError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let ps: PsLine = serde_json::from_str(line)
                .map_err(|e| RegistryError::Malformed(format!("docker ps: {}", e)))?;
            // Older daemons only report the human readable status.
            let state = match ps.state {
                Some(state) if !state.is_empty() => ContainerState::parse(&state),
                _ if ps.status.starts_with("Up") => ContainerState::Running,
                _ if ps.status.starts_with("Exited") => ContainerState::Exited,
                _ => ContainerState::Other(ps.status.to_ascii_lowercase()),
            };
            Ok(ManagedContainer {
                id: ContainerId::from(ps.id),
                name: ps.names.split(',').next().unwrap_or_default().to_string(),
                state,
                managed: false,
            })
        })
        .collect()
}

fn parse_inspect(stdout: &str, group_label: &str, group: &str) -> Result<ManagedContainer, RegistryError> {
    let inspect: Inspect = serde_json::from_str(stdout.trim())
        .map_err(|e| RegistryError::Malformed(format!("docker inspect: {}", e)))?;
    let managed = inspect
        .config
        .and_then(|config| config.labels)
        .and_then(|labels| labels.get(group_label).cloned())
        .map_or(false, |value| value == group);
    Ok(ManagedContainer {
        id: ContainerId::from(inspect.id),
        name: inspect.name.trim_start_matches('/').to_string(),
        state: ContainerState::parse(&inspect.state.status),
        managed,
    })
}
