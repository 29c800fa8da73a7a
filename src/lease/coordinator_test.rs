use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;

use super::{
    coordinator::{AcquireOutcome, InvalidInput, LockCoordinator, ReleaseOutcome},
    memory::MemoryLeaseStore,
    reaper::{Reaper, SweepOutcome},
    store::{Entry, LeaseStore},
    ContainerId, LeaseKey, ACTIVE_SET,
};
use crate::{
    error::{CoordinatorError, RegistryError, StoreError},
    registry::{ContainerRegistry, ContainerState, ManagedContainer, MemoryRegistry, RegistryHealth},
};

const TTL: Duration = Duration::from_secs(300);

struct Harness {
    store: Arc<MemoryLeaseStore>,
    registry: Arc<MemoryRegistry>,
    coordinator: LockCoordinator,
}

async fn harness(containers: &[&str]) -> Harness {
    harness_with(containers, TTL, Duration::from_secs(3)).await
}

async fn harness_with(containers: &[&str], ttl: Duration, timeout: Duration) -> Harness {
    let store = Arc::new(MemoryLeaseStore::new());
    let registry = Arc::new(MemoryRegistry::new());
    for id in containers {
        registry.insert_running(id).await;
    }
    let coordinator = LockCoordinator::with_timeout(store.clone(), registry.clone(), ttl, timeout);
    Harness {
        store,
        registry,
        coordinator,
    }
}

fn key(raw: &str) -> LeaseKey {
    LeaseKey::from(raw)
}

fn id(raw: &str) -> ContainerId {
    ContainerId::from(raw)
}

#[tokio::test]
async fn one_container_per_key() {
    let h = harness(&["cont-123", "cont-456"]).await;
    let ip = key("1.2.3.4");

    let first = h.coordinator.acquire(&ip, &id("cont-123")).await.unwrap();
    match first {
        AcquireOutcome::Granted(lease) => {
            assert_eq!(lease.key, ip);
            assert_eq!(lease.container, id("cont-123"));
            assert_eq!(lease.ttl, TTL);
        }
        other => panic!("expected a grant, got {:?}", other),
    }

    let second = h.coordinator.acquire(&ip, &id("cont-456")).await.unwrap();
    assert_eq!(
        second,
        AcquireOutcome::DeniedKeyBusy {
            existing: id("cont-123")
        }
    );

    let active = h.coordinator.list_active().await.unwrap();
    assert_eq!(active.into_iter().collect::<Vec<_>>(), vec![id("cont-123")]);
}

#[tokio::test]
async fn reacquiring_the_same_container_is_key_busy() {
    let h = harness(&["c1"]).await;
    let ip = key("1.2.3.4");

    assert!(h.coordinator.acquire(&ip, &id("c1")).await.unwrap().is_granted());
    assert_eq!(
        h.coordinator.acquire(&ip, &id("c1")).await.unwrap(),
        AcquireOutcome::DeniedKeyBusy { existing: id("c1") }
    );
}

#[tokio::test]
async fn one_key_per_container() {
    let h = harness(&["c1"]).await;

    assert!(h
        .coordinator
        .acquire(&key("10.0.0.1"), &id("c1"))
        .await
        .unwrap()
        .is_granted());
    assert_eq!(
        h.coordinator.acquire(&key("10.0.0.2"), &id("c1")).await.unwrap(),
        AcquireOutcome::DeniedContainerBusy {
            holder: key("10.0.0.1")
        }
    );
    assert_eq!(h.coordinator.inspect(&key("10.0.0.2")).await.unwrap(), None);
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_once() {
    let h = harness(&["shared"]).await;
    let container = id("shared");

    let attempts = (0..50).map(|i| {
        let coordinator = h.coordinator.clone();
        let container = container.clone();
        tokio::spawn(async move {
            coordinator
                .acquire(&key(&format!("10.0.0.{}", i)), &container)
                .await
        })
    });
    let outcomes: Vec<AcquireOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let granted = outcomes.iter().filter(|o| o.is_granted()).count();
    let busy = outcomes
        .iter()
        .filter(|o| matches!(o, AcquireOutcome::DeniedContainerBusy { .. }))
        .count();
    assert_eq!(granted, 1);
    assert_eq!(busy, 49);
    assert_eq!(h.coordinator.live_leases().await.unwrap().len(), 1);
}

#[tokio::test]
async fn coordinators_sharing_a_store_never_double_grant() {
    let h = harness(&["shared"]).await;
    let other = LockCoordinator::new(h.store.clone(), h.registry.clone(), TTL);
    let container = id("shared");

    let (key_a, key_b) = (key("10.0.0.1"), key("10.0.0.2"));
    let (a, b) = tokio::join!(
        h.coordinator.acquire(&key_a, &container),
        other.acquire(&key_b, &container),
    );
    let granted = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| o.is_granted())
        .count();
    assert!(granted <= 1);
    assert!(h.coordinator.live_leases().await.unwrap().len() <= 1);

    // Once settled, the loser of a sequential race sees the winner.
    h.coordinator.release(&key("10.0.0.1")).await.unwrap();
    other.release(&key("10.0.0.2")).await.unwrap();
    assert!(h
        .coordinator
        .acquire(&key("10.0.0.1"), &container)
        .await
        .unwrap()
        .is_granted());
    assert_eq!(
        other.acquire(&key("10.0.0.2"), &container).await.unwrap(),
        AcquireOutcome::DeniedContainerBusy {
            holder: key("10.0.0.1")
        }
    );
}

#[tokio::test]
async fn unmanaged_and_unknown_containers_are_refused() {
    let h = harness(&[]).await;
    h.registry
        .insert(ManagedContainer {
            id: id("stray"),
            name: "stray".to_string(),
            state: ContainerState::Running,
            managed: false,
        })
        .await;
    let ip = key("1.2.3.4");

    assert_eq!(
        h.coordinator.acquire(&ip, &id("stray")).await.unwrap(),
        AcquireOutcome::DeniedNotManaged
    );
    assert_eq!(
        h.coordinator.acquire(&ip, &id("nope")).await.unwrap(),
        AcquireOutcome::DeniedNotManaged
    );
    assert_eq!(h.coordinator.inspect(&ip).await.unwrap(), None);
    assert!(h.coordinator.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn blank_input_is_rejected() {
    let h = harness(&["c1"]).await;

    assert_eq!(
        h.coordinator.acquire(&key(""), &id("c1")).await.unwrap(),
        AcquireOutcome::DeniedInvalidInput(InvalidInput::EmptyKey)
    );
    assert_eq!(
        h.coordinator.acquire(&key("1.2.3.4"), &id("  ")).await.unwrap(),
        AcquireOutcome::DeniedInvalidInput(InvalidInput::EmptyContainer)
    );
    assert_eq!(
        h.coordinator.release(&key("")).await.unwrap(),
        ReleaseOutcome::NotFound
    );
    assert_eq!(h.coordinator.inspect(&key("")).await.unwrap(), None);
}

#[tokio::test]
async fn release_frees_both_sides_and_is_idempotent() {
    let h = harness(&["c1"]).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c1")).await.unwrap();

    assert_eq!(
        h.coordinator.release(&ip).await.unwrap(),
        ReleaseOutcome::Released(id("c1"))
    );
    assert_eq!(
        h.coordinator.release(&ip).await.unwrap(),
        ReleaseOutcome::NotFound
    );
    assert!(h.coordinator.list_active().await.unwrap().is_empty());

    // The container is free for someone else now.
    assert!(h
        .coordinator
        .acquire(&key("5.6.7.8"), &id("c1"))
        .await
        .unwrap()
        .is_granted());
}

#[tokio::test]
async fn stale_release_leaves_a_newer_lease_alone() {
    let h = harness(&["c1", "c2"]).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c2")).await.unwrap();

    assert_eq!(
        h.coordinator.release_stale(&ip, &id("c1")).await.unwrap(),
        ReleaseOutcome::NotFound
    );
    assert_eq!(
        h.coordinator.inspect(&ip).await.unwrap().map(|l| l.container),
        Some(id("c2"))
    );
}

#[tokio::test]
async fn leases_expire_with_their_ttl() {
    let h = harness_with(&["c1"], Duration::from_millis(50), Duration::from_secs(3)).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c1")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(h.coordinator.inspect(&ip).await.unwrap(), None);
    assert!(h
        .coordinator
        .acquire(&key("5.6.7.8"), &id("c1"))
        .await
        .unwrap()
        .is_granted());
}

#[tokio::test]
async fn inspect_reports_the_live_lease() {
    let h = harness(&["c1"]).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c1")).await.unwrap();

    let lease = h.coordinator.inspect(&ip).await.unwrap().unwrap();
    assert_eq!(lease.container, id("c1"));
    assert!(lease.expires_at() > chrono::Utc::now());

    let session = h.coordinator.session(&ip).await.unwrap().unwrap();
    assert_eq!(session.name, "c1");
    assert_eq!(session.state, ContainerState::Running);
}

#[tokio::test]
async fn inspect_releases_leases_on_vanished_containers() {
    let h = harness(&["c1"]).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c1")).await.unwrap();
    h.registry.remove(&id("c1")).await;

    assert_eq!(h.coordinator.inspect(&ip).await.unwrap(), None);
    assert_eq!(h.store.get("lock:1.2.3.4").await.unwrap(), None);
    assert!(h.coordinator.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn store_outage_is_an_error_not_an_absence() {
    let h = harness(&["c1"]).await;
    let ip = key("1.2.3.4");
    h.coordinator.acquire(&ip, &id("c1")).await.unwrap();
    h.store.set_available(false);

    assert!(matches!(
        h.coordinator.inspect(&ip).await,
        Err(CoordinatorError::StoreUnavailable(_))
    ));
    assert!(matches!(
        h.coordinator.release(&ip).await,
        Err(CoordinatorError::StoreUnavailable(_))
    ));
    assert!(matches!(
        h.coordinator.acquire(&key("5.6.7.8"), &id("c1")).await,
        Err(CoordinatorError::StoreUnavailable(_))
    ));
    assert!(h.coordinator.list_active().await.is_err());

    h.store.set_available(true);
    assert!(h.coordinator.inspect(&ip).await.unwrap().is_some());
}

#[tokio::test]
async fn registry_outage_is_an_error() {
    let h = harness(&["c1"]).await;
    h.registry.set_available(false);

    assert!(matches!(
        h.coordinator.acquire(&key("1.2.3.4"), &id("c1")).await,
        Err(CoordinatorError::RegistryUnavailable(_))
    ));
    assert!(h.coordinator.describe_all().await.is_err());
    assert!(h.coordinator.live_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_store_times_out() {
    let h = harness_with(&["c1"], TTL, Duration::from_millis(20)).await;
    h.store.set_latency(Duration::from_millis(200));

    match h.coordinator.acquire(&key("1.2.3.4"), &id("c1")).await {
        Err(CoordinatorError::StoreUnavailable(StoreError::Timeout { after, .. })) => {
            assert_eq!(after, Duration::from_millis(20))
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn dropped_acquire_still_completes() {
    let h = harness(&["c1"]).await;
    h.store.set_latency(Duration::from_millis(20));
    let ip = key("1.2.3.4");

    let dropped =
        tokio::time::timeout(Duration::from_millis(5), h.coordinator.acquire(&ip, &id("c1"))).await;
    assert!(dropped.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    h.store.set_latency(Duration::ZERO);

    // Either both the lease and its index entry exist, or neither does.
    let lease = h.coordinator.inspect(&ip).await.unwrap();
    let active = h.coordinator.list_active().await.unwrap();
    assert_eq!(lease.is_some(), active.contains(&id("c1")));
    assert!(lease.is_some());
}

#[tokio::test]
async fn describe_all_joins_holders() {
    let h = harness(&["c2", "c1"]).await;
    h.registry
        .insert(ManagedContainer {
            id: id("c0"),
            name: "hidden".to_string(),
            state: ContainerState::Running,
            managed: false,
        })
        .await;
    h.registry
        .set_state(&id("c1"), ContainerState::Exited)
        .await;
    h.coordinator.acquire(&key("1.2.3.4"), &id("c2")).await.unwrap();

    let rows = h.coordinator.describe_all().await.unwrap();
    let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
    assert_eq!(rows[0].state, ContainerState::Exited);
    assert_eq!(rows[0].locked_by, None);
    assert_eq!(rows[1].locked_by, Some(key("1.2.3.4")));
}

#[tokio::test]
async fn container_status_covers_unknown_containers() {
    let h = harness(&["c1"]).await;
    h.coordinator.acquire(&key("1.2.3.4"), &id("c1")).await.unwrap();

    let locked = h.coordinator.container_status(&id("c1")).await.unwrap();
    assert!(locked.is_locked());
    assert_eq!(locked.name.as_deref(), Some("c1"));
    assert_eq!(locked.locked_by, Some(key("1.2.3.4")));

    let unknown = h.coordinator.container_status(&id("ghost")).await.unwrap();
    assert!(!unknown.is_locked());
    assert_eq!(unknown.state, None);
    assert_eq!(unknown.name, None);
}

#[tokio::test]
async fn reconcile_repairs_the_active_set() {
    let h = harness(&["c1"]).await;
    h.coordinator.acquire(&key("1.2.3.4"), &id("c1")).await.unwrap();
    h.store.remove_from_set(ACTIVE_SET, "c1").await.unwrap();
    h.store.add_to_set(ACTIVE_SET, "ghost").await.unwrap();

    assert_eq!(h.coordinator.reconcile_active_set().await.unwrap(), 2);
    let active: Vec<ContainerId> = h.coordinator.list_active().await.unwrap().into_iter().collect();
    assert_eq!(active, vec![id("c1")]);

    assert_eq!(h.coordinator.reconcile_active_set().await.unwrap(), 0);
}

#[tokio::test]
async fn expired_leases_drop_out_of_the_active_list() {
    let h = harness(&["c1"]).await;
    h.coordinator.acquire(&key("1.2.3.4"), &id("c1")).await.unwrap();
    h.store.expire("lock:1.2.3.4").await;

    assert!(h.coordinator.list_active().await.unwrap().is_empty());

    // The stored index still lags until reconciliation.
    assert!(h.store.members(ACTIVE_SET).await.unwrap().contains("c1"));
    assert_eq!(h.coordinator.reconcile_active_set().await.unwrap(), 1);
    assert!(h.store.members(ACTIVE_SET).await.unwrap().is_empty());
}

/// Resolves names to container ids the way `docker inspect` does.
struct AliasRegistry {
    inner: MemoryRegistry,
    aliases: HashMap<String, ContainerId>,
}

#[async_trait]
impl ContainerRegistry for AliasRegistry {
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RegistryError> {
        self.inner.list_managed().await
    }

    async fn get(&self, id: &ContainerId) -> Result<Option<ManagedContainer>, RegistryError> {
        let id = self.aliases.get(id.as_str()).unwrap_or(id);
        self.inner.get(id).await
    }

    async fn ping(&self) -> Result<RegistryHealth, RegistryError> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn names_and_ids_of_one_container_share_its_lease() {
    let inner = MemoryRegistry::new();
    inner
        .insert(ManagedContainer {
            id: id("abc123"),
            name: "kali-1".to_string(),
            state: ContainerState::Running,
            managed: true,
        })
        .await;
    let mut aliases = HashMap::new();
    aliases.insert("kali-1".to_string(), id("abc123"));
    let registry = Arc::new(AliasRegistry { inner, aliases });
    let store = Arc::new(MemoryLeaseStore::new());
    let coordinator = LockCoordinator::new(store, registry.clone(), TTL);

    match coordinator.acquire(&key("10.0.0.1"), &id("kali-1")).await.unwrap() {
        AcquireOutcome::Granted(lease) => assert_eq!(lease.container, id("abc123")),
        other => panic!("expected a grant, got {:?}", other),
    }
    assert_eq!(
        coordinator.acquire(&key("10.0.0.2"), &id("abc123")).await.unwrap(),
        AcquireOutcome::DeniedContainerBusy {
            holder: key("10.0.0.1")
        }
    );

    let rows = coordinator.describe_all().await.unwrap();
    assert_eq!(rows[0].locked_by, Some(key("10.0.0.1")));
    let status = coordinator.container_status(&id("kali-1")).await.unwrap();
    assert_eq!(status.id, id("abc123"));
    assert_eq!(status.locked_by, Some(key("10.0.0.1")));

    // A sweep matches the lease against the registry's ids and keeps it.
    let reaper = Reaper::new(coordinator.clone(), registry, Duration::from_secs(3));
    match reaper.sweep_now().await.unwrap() {
        SweepOutcome::Completed(report) => assert_eq!(report.released, 0),
        SweepOutcome::Skipped => panic!("sweep was skipped"),
    }
    assert!(coordinator.inspect(&key("10.0.0.1")).await.unwrap().is_some());
}

/// Memory store with switchable faults around individual calls.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryLeaseStore,
    /// Commits conditional writes but answers with a transient error.
    lose_write_reply: AtomicBool,
    /// Commits conditional writes but answers "refused", as a retry of a
    /// committed write would.
    refuse_committed_write: AtomicBool,
    fail_set_removal: AtomicBool,
}

#[async_trait]
impl LeaseStore for FaultyStore {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let written = self
            .inner
            .conditional_set(key, value, ttl, only_if_absent)
            .await?;
        if written && self.lose_write_reply.load(Ordering::SeqCst) {
            return Err(StoreError::transient("conditional_set", "connection reset"));
        }
        if written && self.refuse_committed_write.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.inner.add_to_set(set, member).await
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        if self.fail_set_removal.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("remove_from_set", "connection refused"));
        }
        self.inner.remove_from_set(set, member).await
    }

    async fn members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        self.inner.members(set).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.scan(prefix).await
    }
}

async fn faulty_harness() -> (Arc<FaultyStore>, LockCoordinator) {
    let store = Arc::new(FaultyStore::default());
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_running("c1").await;
    let coordinator = LockCoordinator::new(store.clone(), registry, TTL);
    (store, coordinator)
}

#[tokio::test]
async fn committed_write_with_a_lost_reply_is_granted() {
    let (store, coordinator) = faulty_harness().await;
    store.lose_write_reply.store(true, Ordering::SeqCst);
    let ip = key("1.2.3.4");

    assert!(coordinator.acquire(&ip, &id("c1")).await.unwrap().is_granted());
    assert_eq!(
        coordinator.inspect(&ip).await.unwrap().map(|lease| lease.container),
        Some(id("c1"))
    );
    assert!(coordinator.list_active().await.unwrap().contains(&id("c1")));
}

#[tokio::test]
async fn committed_write_reported_as_refused_is_granted() {
    let (store, coordinator) = faulty_harness().await;
    store.refuse_committed_write.store(true, Ordering::SeqCst);
    let ip = key("1.2.3.4");

    assert!(coordinator.acquire(&ip, &id("c1")).await.unwrap().is_granted());
    assert_eq!(
        coordinator.acquire(&key("5.6.7.8"), &id("c1")).await.unwrap(),
        AcquireOutcome::DeniedContainerBusy { holder: ip }
    );
}

#[tokio::test]
async fn release_survives_a_failed_index_update() {
    let (store, coordinator) = faulty_harness().await;
    let ip = key("1.2.3.4");
    coordinator.acquire(&ip, &id("c1")).await.unwrap();
    store.fail_set_removal.store(true, Ordering::SeqCst);

    assert_eq!(
        coordinator.release(&ip).await.unwrap(),
        ReleaseOutcome::Released(id("c1"))
    );
    assert_eq!(coordinator.inspect(&ip).await.unwrap(), None);
    assert!(coordinator.list_active().await.unwrap().is_empty());

    store.fail_set_removal.store(false, Ordering::SeqCst);
    assert_eq!(coordinator.reconcile_active_set().await.unwrap(), 1);
    assert!(store.members(ACTIVE_SET).await.unwrap().is_empty());
}
