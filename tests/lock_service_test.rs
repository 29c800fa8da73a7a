use std::{sync::Arc, time::Duration};

use container_lock::{
    config::LockConfig,
    gateway::{self, ButtonState},
    lease::{memory::MemoryLeaseStore, reaper::SweepOutcome},
    registry::{ContainerRegistry, ContainerState, MemoryRegistry},
    AcquireOutcome, ContainerId, LeaseKey, LockService, ReleaseOutcome,
};

fn config() -> LockConfig {
    LockConfig {
        reaper_interval: Duration::from_millis(50),
        registry_cache_ttl: Duration::from_millis(10),
        ..LockConfig::default()
    }
}

async fn service(containers: &[&str]) -> (Arc<MemoryRegistry>, LockService) {
    let registry = Arc::new(MemoryRegistry::new());
    for id in containers {
        registry.insert_running(id).await;
    }
    let service = LockService::from_parts(
        Arc::new(MemoryLeaseStore::new()),
        registry.clone(),
        &config(),
    );
    (registry, service)
}

#[tokio::test]
async fn background_reaper_frees_stopped_containers() {
    let (registry, service) = service(&["c1"]).await;
    let ip = LeaseKey::from("1.2.3.4");
    let container = ContainerId::from("c1");

    service.start();
    assert!(service.is_running());

    assert!(service
        .coordinator()
        .acquire(&ip, &container)
        .await
        .unwrap()
        .is_granted());
    registry.set_state(&container, ContainerState::Exited).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(service.coordinator().inspect(&ip).await.unwrap(), None);

    service.shutdown().await;
    assert!(!service.is_running());
}

#[tokio::test]
async fn manual_sweep_without_the_background_loop() {
    let (registry, service) = service(&["c1", "c2"]).await;
    let coordinator = service.coordinator();
    coordinator
        .acquire(&LeaseKey::from("10.0.0.1"), &ContainerId::from("c1"))
        .await
        .unwrap();
    coordinator
        .acquire(&LeaseKey::from("10.0.0.2"), &ContainerId::from("c2"))
        .await
        .unwrap();
    registry.remove(&ContainerId::from("c2")).await;

    match service.sweep_now().await.unwrap() {
        SweepOutcome::Completed(report) => {
            assert_eq!(report.inspected, 2);
            assert_eq!(report.released, 1);
        }
        SweepOutcome::Skipped => panic!("nothing else was sweeping"),
    }
    assert!(!service.is_running());
}

#[tokio::test]
async fn request_flow_through_the_gateway_helpers() {
    let (registry, service) = service(&["lab-1", "lab-2"]).await;
    let coordinator = service.coordinator();
    assert_eq!(service.lease_ttl(), Duration::from_secs(300));
    assert_eq!(registry.ping().await.unwrap().containers, 2);

    let alice = gateway::lease_key(Some("203.0.113.7, 10.0.0.1"), None, None).unwrap();
    let bob = gateway::lease_key(None, Some("198.51.100.4"), None).unwrap();

    assert!(coordinator
        .acquire(&alice, &ContainerId::from("lab-1"))
        .await
        .unwrap()
        .is_granted());
    assert_eq!(
        coordinator
            .acquire(&bob, &ContainerId::from("lab-1"))
            .await
            .unwrap(),
        AcquireOutcome::DeniedContainerBusy {
            holder: alice.clone()
        }
    );

    let alice_holds = coordinator.inspect(&alice).await.unwrap().map(|l| l.container);
    let bob_holds = coordinator.inspect(&bob).await.unwrap().map(|l| l.container);
    let rows = coordinator.describe_all().await.unwrap();
    let for_alice: Vec<ButtonState> = rows
        .iter()
        .map(|row| ButtonState::for_viewer(row, Some(&alice), alice_holds.as_ref()))
        .collect();
    let for_bob: Vec<ButtonState> = rows
        .iter()
        .map(|row| ButtonState::for_viewer(row, Some(&bob), bob_holds.as_ref()))
        .collect();

    assert_eq!(
        for_alice,
        vec![
            ButtonState::Connect,
            ButtonState::Elsewhere {
                holding: ContainerId::from("lab-1")
            },
        ]
    );
    assert_eq!(
        for_bob,
        vec![
            ButtonState::InUse { by: alice.clone() },
            ButtonState::Connect,
        ]
    );

    assert_eq!(
        coordinator.release(&alice).await.unwrap(),
        ReleaseOutcome::Released(ContainerId::from("lab-1"))
    );
    assert!(coordinator.list_active().await.unwrap().is_empty());
}
