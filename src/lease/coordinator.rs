//! Lease bookkeeping over a shared store.
//!
//! Layout in the store: `lock:{key}` holds the container id with the store's
//! native TTL, and the `active_containers` set mirrors every container under
//! a live lease. Nothing else is persisted.
//!
//! # Serialization
//!
//! Mutations take a striped mutex for the key and then one for the container,
//! always in that order. That serializes callers inside one process. Across
//! processes the key record is written with set-if-absent, and after the
//! write every holder of the container is looked up again: a writer that
//! finds a rival backs out. Since each writer writes before it re-checks, two
//! writers can never both miss each other.
//!
//! Mutating critical sections run on a detached task so that dropping the
//! caller's future cannot stop them halfway through.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    store::{bounded, LeaseStore},
    stripes::StripedLocks,
    new_token, record_value, ContainerId, Lease, LeaseKey, ACTIVE_SET, LEASE_PREFIX,
};
use crate::{
    config::DEFAULT_OPERATION_TIMEOUT,
    error::{CoordinatorError, RegistryError, StoreError},
    registry::{ContainerRegistry, ContainerState, ManagedContainer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidInput {
    EmptyKey,
    EmptyContainer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(Lease),
    /// The key already holds a lease, possibly on the very same container.
    DeniedKeyBusy { existing: ContainerId },
    DeniedContainerBusy { holder: LeaseKey },
    DeniedNotManaged,
    DeniedInvalidInput(InvalidInput),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(ContainerId),
    NotFound,
}

/// One row of [`LockCoordinator::describe_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub name: String,
    pub state: ContainerState,
    pub locked_by: Option<LeaseKey>,
}

/// Lock status of a single container, including containers the registry no
/// longer knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerLockStatus {
    pub id: ContainerId,
    pub name: Option<String>,
    /// `None` when the registry does not know the container.
    pub state: Option<ContainerState>,
    pub locked_by: Option<LeaseKey>,
}

impl ContainerLockStatus {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// A lease together with what the registry says about its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub lease: Lease,
    pub name: String,
    pub state: ContainerState,
}

/// Maps client keys to containers with time-bounded leases.
///
/// Holds no authoritative state of its own; any number of coordinators may
/// share one store. Cloning is cheap and clones share their mutex tables.
#[derive(Clone)]
pub struct LockCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn LeaseStore>,
    registry: Arc<dyn ContainerRegistry>,
    lease_ttl: Duration,
    timeout: Duration,
    key_locks: StripedLocks,
    container_locks: StripedLocks,
}

impl LockCoordinator {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        registry: Arc<dyn ContainerRegistry>,
        lease_ttl: Duration,
    ) -> Self {
        Self::with_timeout(store, registry, lease_ttl, DEFAULT_OPERATION_TIMEOUT)
    }

    /// `timeout` bounds every individual store and registry round trip.
    pub fn with_timeout(
        store: Arc<dyn LeaseStore>,
        registry: Arc<dyn ContainerRegistry>,
        lease_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                lease_ttl,
                timeout,
                key_locks: StripedLocks::new(),
                container_locks: StripedLocks::new(),
            }),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.inner.lease_ttl
    }

    pub async fn acquire(
        &self,
        key: &LeaseKey,
        container: &ContainerId,
    ) -> Result<AcquireOutcome, CoordinatorError> {
        if key.is_blank() {
            return Ok(AcquireOutcome::DeniedInvalidInput(InvalidInput::EmptyKey));
        }
        if container.is_blank() {
            return Ok(AcquireOutcome::DeniedInvalidInput(
                InvalidInput::EmptyContainer,
            ));
        }

        let found = match self.inner.lookup(container).await? {
            Some(found) if found.managed => found,
            _ => {
                warn!(ip = %key, container = %container, "container not managed by lock service");
                return Ok(AcquireOutcome::DeniedNotManaged);
            }
        };
        // The registry may accept names or id prefixes. Leases are always
        // keyed by the id it resolved them to.
        if &found.id != container {
            debug!(requested = %container, container = %found.id, "resolved container alias");
        }
        let container = &found.id;

        let inner = self.inner.clone();
        let (owned_key, owned_container) = (key.clone(), container.clone());
        let outcome = detached(async move {
            inner
                .acquire_serialized(owned_key, owned_container)
                .await
        })
        .await?;

        match &outcome {
            AcquireOutcome::Granted(_) => {
                info!(ip = %key, container = %container, "container locked")
            }
            AcquireOutcome::DeniedKeyBusy { existing } => {
                warn!(ip = %key, existing = %existing, "ip already has a container")
            }
            AcquireOutcome::DeniedContainerBusy { holder } => {
                warn!(container = %container, holder = %holder, "container already locked")
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Idempotent. The release is done once the lease record is deleted,
    /// even if its `active_containers` entry could not be dropped.
    pub async fn release(&self, key: &LeaseKey) -> Result<ReleaseOutcome, CoordinatorError> {
        self.release_matching(key, None).await
    }

    /// Releases `key` only while it still holds `container`. Used to clean up
    /// after a container disappeared without racing a fresh acquisition.
    pub(crate) async fn release_stale(
        &self,
        key: &LeaseKey,
        container: &ContainerId,
    ) -> Result<ReleaseOutcome, CoordinatorError> {
        self.release_matching(key, Some(container.clone())).await
    }

    async fn release_matching(
        &self,
        key: &LeaseKey,
        expected: Option<ContainerId>,
    ) -> Result<ReleaseOutcome, CoordinatorError> {
        if key.is_blank() {
            return Ok(ReleaseOutcome::NotFound);
        }
        let inner = self.inner.clone();
        let owned_key = key.clone();
        let outcome =
            detached(async move { inner.release_serialized(owned_key, expected).await }).await?;
        if let ReleaseOutcome::Released(container) = &outcome {
            info!(ip = %key, container = %container, "container released");
        }
        Ok(outcome)
    }

    /// The live lease of `key`. A lease whose container vanished from the
    /// registry is released on the spot and reported as absent.
    pub async fn inspect(&self, key: &LeaseKey) -> Result<Option<Lease>, CoordinatorError> {
        Ok(self.session(key).await?.map(|session| session.lease))
    }

    pub async fn session(&self, key: &LeaseKey) -> Result<Option<ActiveSession>, CoordinatorError> {
        if key.is_blank() {
            return Ok(None);
        }
        let lease = match self.inner.read(key).await? {
            Some(lease) => lease,
            None => return Ok(None),
        };
        match self.inner.lookup(&lease.container).await? {
            Some(found) if found.managed => Ok(Some(ActiveSession {
                lease,
                name: found.name,
                state: found.state,
            })),
            _ => {
                info!(ip = %key, container = %lease.container, "leased container is gone, releasing");
                self.release_stale(key, &lease.container).await?;
                Ok(None)
            }
        }
    }

    /// Containers under a live lease.
    ///
    /// Read from the lease records themselves, so a lease that just expired in
    /// the store is never reported. The stored `active_containers` set lags
    /// behind expiry until [`reconcile_active_set`] catches up.
    ///
    /// [`reconcile_active_set`]: LockCoordinator::reconcile_active_set
    pub async fn list_active(&self) -> Result<BTreeSet<ContainerId>, CoordinatorError> {
        Ok(self
            .inner
            .live_leases()
            .await?
            .into_iter()
            .map(|lease| lease.container)
            .collect())
    }

    /// Every managed container joined with its lease holder, ordered by id.
    pub async fn describe_all(&self) -> Result<Vec<ContainerStatus>, CoordinatorError> {
        let mut containers = self.inner.list_managed().await?;
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        let holders: HashMap<ContainerId, LeaseKey> = self
            .live_leases()
            .await?
            .into_iter()
            .map(|lease| (lease.container, lease.key))
            .collect();

        Ok(containers
            .into_iter()
            .map(|container| ContainerStatus {
                locked_by: holders.get(&container.id).cloned(),
                id: container.id,
                name: container.name,
                state: container.state,
            })
            .collect())
    }

    pub async fn container_status(
        &self,
        container: &ContainerId,
    ) -> Result<ContainerLockStatus, CoordinatorError> {
        let found = self.inner.lookup(container).await?;
        let id = found
            .as_ref()
            .map_or_else(|| container.clone(), |found| found.id.clone());
        let locked_by = self.inner.holders(&id).await?.into_iter().next();
        Ok(ContainerLockStatus {
            id,
            name: found.as_ref().map(|found| found.name.clone()),
            state: found.map(|found| found.state),
            locked_by,
        })
    }

    /// Every live lease, straight from the store.
    pub async fn live_leases(&self) -> Result<Vec<Lease>, CoordinatorError> {
        Ok(self.inner.live_leases().await?)
    }

    /// Rebuilds the active set from the lease records themselves. Returns how
    /// many members had to be added or removed.
    pub async fn reconcile_active_set(&self) -> Result<usize, CoordinatorError> {
        let inner = self.inner.clone();
        detached(async move { inner.reconcile_active_set().await }).await
    }
}

impl Inner {
    async fn read(&self, key: &LeaseKey) -> Result<Option<Lease>, StoreError> {
        let entry = bounded("get", self.timeout, self.store.get(&key.store_key())).await?;
        Ok(entry.map(|entry| Lease::from_entry(key.clone(), entry, self.lease_ttl)))
    }

    async fn live_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let store_keys = bounded("scan", self.timeout, self.store.scan(LEASE_PREFIX)).await?;
        let keys: Vec<LeaseKey> = store_keys
            .iter()
            .filter_map(|store_key| LeaseKey::from_store_key(store_key))
            .collect();
        let reads = join_all(keys.iter().map(|key| self.read(key))).await;

        let mut leases = Vec::with_capacity(keys.len());
        for read in reads {
            // Keys that expired between the scan and the read simply drop out.
            if let Some(lease) = read? {
                leases.push(lease);
            }
        }
        Ok(leases)
    }

    async fn holders(&self, container: &ContainerId) -> Result<Vec<LeaseKey>, StoreError> {
        Ok(self
            .live_leases()
            .await?
            .into_iter()
            .filter(|lease| &lease.container == container)
            .map(|lease| lease.key)
            .collect())
    }

    async fn lookup(&self, container: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError> {
        match tokio::time::timeout(self.timeout, self.registry.get(container)).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout {
                command: format!("get {}", container),
                after: self.timeout,
            }),
        }
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

    async fn acquire_serialized(
        &self,
        key: LeaseKey,
        container: ContainerId,
    ) -> Result<AcquireOutcome, CoordinatorError> {
        let _key_guard = self.key_locks.lock(key.as_str()).await;
        let _container_guard = self.container_locks.lock(container.as_str()).await;

        if let Some(existing) = self.read(&key).await? {
            return Ok(AcquireOutcome::DeniedKeyBusy {
                existing: existing.container,
            });
        }
        if let Some(holder) = self.rival(&key, &container).await? {
            return Ok(AcquireOutcome::DeniedContainerBusy { holder });
        }

        let acquired_at = Utc::now();
        let token = new_token();
        let written = bounded(
            "conditional_set",
            self.timeout,
            self.store.conditional_set(
                &key.store_key(),
                &record_value(&container, &token),
                self.lease_ttl,
                true,
            ),
        )
        .await;
        if !matches!(written, Ok(true)) {
            // Either another coordinator got there between our read and our
            // write, or our own write landed and only its answer was lost.
            match self.read(&key).await {
                Ok(Some(existing)) if existing.token.as_deref() == Some(token.as_str()) => {
                    debug!(ip = %key, container = %container, "conditional write landed despite a failed reply");
                }
                Ok(Some(existing)) => {
                    return Ok(AcquireOutcome::DeniedKeyBusy {
                        existing: existing.container,
                    })
                }
                Ok(None) => {
                    return Err(written
                        .err()
                        .unwrap_or_else(|| {
                            StoreError::transient(
                                "conditional_set",
                                "conditional write refused but no lease is visible",
                            )
                        })
                        .into())
                }
                Err(read_error) => {
                    warn!(ip = %key, error = %read_error, "could not confirm conditional write, it will expire on its own");
                    return Err(written.err().unwrap_or(read_error).into());
                }
            }
        }

        if let Err(e) = bounded(
            "add_to_set",
            self.timeout,
            self.store.add_to_set(ACTIVE_SET, container.as_str()),
        )
        .await
        {
            self.back_out(&key).await;
            return Err(e.into());
        }

        let rival = match self.rival(&key, &container).await {
            Ok(rival) => rival,
            Err(e) => {
                self.back_out(&key).await;
                return Err(e.into());
            }
        };
        if let Some(holder) = rival {
            debug!(ip = %key, container = %container, rival = %holder, "lost cross-instance race");
            self.back_out(&key).await;
            return Ok(AcquireOutcome::DeniedContainerBusy { holder });
        }

        Ok(AcquireOutcome::Granted(Lease {
            key,
            container,
            acquired_at,
            ttl: self.lease_ttl,
            token: Some(token),
        }))
    }

    async fn rival(
        &self,
        key: &LeaseKey,
        container: &ContainerId,
    ) -> Result<Option<LeaseKey>, StoreError> {
        Ok(self
            .holders(container)
            .await?
            .into_iter()
            .find(|holder| holder != key))
    }

    /// Undoes our own lease record. Set membership is left alone: a rival may
    /// own it, and a stray member is repaired by the next reconciliation.
    async fn back_out(&self, key: &LeaseKey) {
        if let Err(e) = bounded("delete", self.timeout, self.store.delete(&key.store_key())).await
        {
            warn!(ip = %key, error = %e, "failed to back out lease, it will expire on its own");
        }
    }

    async fn release_serialized(
        &self,
        key: LeaseKey,
        expected: Option<ContainerId>,
    ) -> Result<ReleaseOutcome, CoordinatorError> {
        let _key_guard = self.key_locks.lock(key.as_str()).await;
        let lease = match self.read(&key).await? {
            Some(lease) => lease,
            None => return Ok(ReleaseOutcome::NotFound),
        };
        if let Some(expected) = expected {
            if lease.container != expected {
                return Ok(ReleaseOutcome::NotFound);
            }
        }

        let _container_guard = self.container_locks.lock(lease.container.as_str()).await;
        let removed = bounded("delete", self.timeout, self.store.delete(&key.store_key())).await?;
        // The lease itself is gone at this point; a leftover member is only
        // an index entry and reconciliation drops it.
        if let Err(e) = bounded(
            "remove_from_set",
            self.timeout,
            self.store.remove_from_set(ACTIVE_SET, lease.container.as_str()),
        )
        .await
        {
            warn!(ip = %key, container = %lease.container, error = %e, "failed to drop active container entry");
        }

        if removed {
            Ok(ReleaseOutcome::Released(lease.container))
        } else {
            Ok(ReleaseOutcome::NotFound)
        }
    }

    async fn reconcile_active_set(&self) -> Result<usize, StoreError> {
        let leased: BTreeSet<ContainerId> = self
            .live_leases()
            .await?
            .into_iter()
            .map(|lease| lease.container)
            .collect();
        let members: BTreeSet<ContainerId> =
            bounded("members", self.timeout, self.store.members(ACTIVE_SET))
                .await?
                .into_iter()
                .map(ContainerId::from)
                .collect();

        let mut repaired = 0;
        for stale in members.difference(&leased) {
            let _guard = self.container_locks.lock(stale.as_str()).await;
            // Re-check under the lock, an acquisition may have just landed.
            if self.holders(stale).await?.is_empty() {
                bounded(
                    "remove_from_set",
                    self.timeout,
                    self.store.remove_from_set(ACTIVE_SET, stale.as_str()),
                )
                .await?;
                debug!(container = %stale, "removed stale active container");
                repaired += 1;
            }
        }
        for missing in leased.difference(&members) {
            let _guard = self.container_locks.lock(missing.as_str()).await;
            if !self.holders(missing).await?.is_empty() {
                bounded(
                    "add_to_set",
                    self.timeout,
                    self.store.add_to_set(ACTIVE_SET, missing.as_str()),
                )
                .await?;
                debug!(container = %missing, "restored missing active container");
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

/// Runs `work` on its own task and waits for it. Dropping the returned future
/// does not cancel the work.
async fn detached<T, E, F>(work: F) -> Result<T, CoordinatorError>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<CoordinatorError> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(output) => output.map_err(Into::into),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(StoreError::unavailable("detached", e).into()),
    }
}
