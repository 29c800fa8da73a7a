use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use super::{
    coordinator::{LockCoordinator, ReleaseOutcome},
    ContainerId,
};
use crate::{
    error::{CoordinatorError, RegistryError},
    registry::{ContainerRegistry, ManagedContainer},
    util::runnable::PeriodicRunnable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    Idle,
    Sweeping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Leases looked at.
    pub inspected: usize,
    pub released: usize,
    /// Cleanups that failed and will be retried next sweep.
    pub failed: usize,
    pub active_set_repaired: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already running.
    Skipped,
}

/// Releases leases whose container is gone or stopped.
///
/// Only ever mutates through [`LockCoordinator`], so it obeys the same
/// serialization as foreground callers.
pub struct Reaper {
    coordinator: LockCoordinator,
    registry: Arc<dyn ContainerRegistry>,
    timeout: Duration,
    sweeping: AtomicBool,
}

/// Puts the reaper back to idle however the sweep ends, cancellation included.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reaper {
    /// `registry` should be the uncached registry: sweeps want the truth.
    pub fn new(
        coordinator: LockCoordinator,
        registry: Arc<dyn ContainerRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            registry,
            timeout,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ReaperState {
        if self.sweeping.load(Ordering::SeqCst) {
            ReaperState::Sweeping
        } else {
            ReaperState::Idle
        }
    }

    /// Runs one sweep now, unless one is already in flight.
    pub async fn sweep_now(&self) -> Result<SweepOutcome, CoordinatorError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sweep already in flight, skipping");
            return Ok(SweepOutcome::Skipped);
        }
        let _guard = SweepGuard(&self.sweeping);

        self.sweep().await.map(SweepOutcome::Completed)
    }

    async fn sweep(&self) -> Result<SweepReport, CoordinatorError> {
        let leases = self.coordinator.live_leases().await?;
        let containers: HashMap<ContainerId, ManagedContainer> = self
            .list_managed()
            .await?
            .into_iter()
            .map(|container| (container.id.clone(), container))
            .collect();

        let mut report = SweepReport {
            inspected: leases.len(),
            ..SweepReport::default()
        };

        for lease in leases {
            let reason = match containers.get(&lease.container) {
                None => "missing",
                Some(container) if container.state.is_terminal() => container.state.as_str(),
                Some(_) => continue,
            };

            match self
                .coordinator
                .release_stale(&lease.key, &lease.container)
                .await
            {
                Ok(ReleaseOutcome::Released(_)) => {
                    info!(ip = %lease.key, container = %lease.container, reason, "reaped lease");
                    report.released += 1;
                }
                Ok(ReleaseOutcome::NotFound) => {
                    debug!(ip = %lease.key, "lease went away before it was reaped");
                }
                Err(e) => {
                    warn!(ip = %lease.key, container = %lease.container, error = %e, "failed to reap lease");
                    report.failed += 1;
                }
            }
        }

        match self.coordinator.reconcile_active_set().await {
            Ok(repaired) => report.active_set_repaired = repaired,
            Err(e) => {
                warn!(error = %e, "failed to reconcile active containers");
                report.failed += 1;
            }
        }

        Ok(report)
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        match tokio::time::timeout(self.timeout, self.registry.list_managed()).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout {
                command: "list_managed".to_string(),
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl PeriodicRunnable for Reaper {
    async fn run_once(&self) {
        match self.sweep_now().await {
            Ok(SweepOutcome::Completed(report)) if report.released > 0 || report.failed > 0 => {
                info!(
                    inspected = report.inspected,
                    released = report.released,
                    failed = report.failed,
                    repaired = report.active_set_repaired,
                    "sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sweep aborted"),
        }
    }
}
