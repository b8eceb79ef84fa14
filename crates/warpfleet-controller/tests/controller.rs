//! The controller driving rollouts from store events.

use std::time::Duration;

use tokio::sync::watch;

use warpfleet_controller::{Controller, ControllerConfig, Reconciler};
use warpfleet_state::{
    Cluster, ConditionStatus, IntOrPercent, ObjectMeta, RolloutStrategy, StateStore, Target,
    UpgradeGroup, UpgradeGroupSpec,
};

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        rollout_requeue_secs: 0,
        backoff_base_ms: 10,
        backoff_max_secs: 1,
        ..Default::default()
    }
}

fn add_cluster(store: &StateStore, name: &str) {
    store
        .create(&Cluster {
            metadata: ObjectMeta::new("fleet", name),
            group: None,
            class_ref: Some("v1".to_string()),
            ready: ConditionStatus::True,
        })
        .unwrap();
}

fn add_group(store: &StateStore, name: &str, max_rollouts: u32) {
    let spec = UpgradeGroupSpec {
        class_name: "v2".to_string(),
        rollout_strategy: Some(RolloutStrategy::rolling(IntOrPercent::Count(max_rollouts))),
        targets: vec![Target::default()],
    };
    store.create(&UpgradeGroup::new("fleet", name, spec)).unwrap();
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn all_on(store: &StateStore, class: &str) -> bool {
    store
        .list_in::<Cluster>("fleet")
        .unwrap()
        .iter()
        .all(|c| c.class_ref.as_deref() == Some(class))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converges_groups_present_at_startup() {
    let store = StateStore::open_in_memory().unwrap();
    for i in 0..6 {
        add_cluster(&store, &format!("c{i}"));
    }
    add_group(&store, "ug", 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(Reconciler::new(store.clone(), store.clone(), config()));
    let events = store.subscribe();
    let handle = tokio::spawn(controller.run(events, shutdown_rx));

    wait_until("rollout", || all_on(&store, "v2")).await;
    wait_until("ready status", || {
        let group: UpgradeGroup = store.get("fleet/ug").unwrap().unwrap();
        group
            .status
            .condition("Ready")
            .is_some_and(|c| c.status == ConditionStatus::True)
    })
    .await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn picks_up_groups_created_while_running() {
    let store = StateStore::open_in_memory().unwrap();
    for i in 0..3 {
        add_cluster(&store, &format!("c{i}"));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(Reconciler::new(store.clone(), store.clone(), config()));
    let handle = tokio::spawn(controller.run(store.subscribe(), shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(all_on(&store, "v1"));

    add_group(&store, "late", 1);
    wait_until("rollout", || all_on(&store, "v2")).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}

#[tokio::test]
async fn stops_when_the_shutdown_sender_goes_away() {
    let store = StateStore::open_in_memory().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = Controller::new(Reconciler::new(store.clone(), store.clone(), config()));
    let handle = tokio::spawn(controller.run(store.subscribe(), shutdown_rx));

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}
