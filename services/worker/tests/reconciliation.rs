//! Reconciliation engine behavior against the mock driver and an
//! in-process controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use vmfleet_model::{Resources, Vm, VmStatus, Worker, RESOURCE_VMS};
use vmfleet_store::Store;
use vmfleet_worker::driver::{DriverStatus, MockDriverFactory, OnDiskVm};
use vmfleet_worker::engine::{Reconciler, ReconcilerConfig, MSG_IMPOSSIBLE, MSG_LOST_TRACK};
use vmfleet_worker::MockController;
use vmfleet_worker::VmDriver;

const WORKER: &str = "w1";

struct Harness {
    store: Arc<Store>,
    factory: Arc<MockDriverFactory>,
    reconciler: Reconciler,
}

fn harness(factory: MockDriverFactory) -> Harness {
    let store = Arc::new(Store::new());
    let client = Arc::new(MockController::new(Arc::clone(&store)));
    let factory = Arc::new(factory);
    let reconciler = Reconciler::new(
        client,
        Arc::clone(&factory) as _,
        ReconcilerConfig {
            worker_name: WORKER.to_owned(),
            machine_id: "machine-1".to_owned(),
            resources: Resources::from([(RESOURCE_VMS, 2)]),
            sync_interval: Duration::from_secs(5),
        },
    );
    Harness {
        store,
        factory,
        reconciler,
    }
}

fn assigned_vm(store: &Store, name: &str) -> Vm {
    let mut vm = Vm::new(name, "ubuntu:latest");
    vm.worker = Some(WORKER.to_owned());
    store.update(|txn| txn.set_vm(vm.clone())).unwrap()
}

fn vm(store: &Store, name: &str) -> Vm {
    store.view(|txn| txn.get_vm(name)).unwrap()
}

#[tokio::test]
async fn pending_vm_is_created_then_reported_running() {
    let h = harness(MockDriverFactory::new());
    assigned_vm(&h.store, "a");

    h.reconciler.sync_vms().await.unwrap();
    assert_eq!(h.factory.calls(), ["create a", "start a"]);
    assert_eq!(vm(&h.store, "a").status, VmStatus::Pending);

    h.reconciler.sync_vms().await.unwrap();
    let reported = vm(&h.store, "a");
    assert_eq!(reported.status, VmStatus::Running);
    assert_eq!(reported.observed_generation, reported.generation);
    assert!(reported.started_at.is_some());
}

#[tokio::test]
async fn deletions_run_before_creations_in_the_same_pass() {
    let h = harness(MockDriverFactory::new());
    assigned_vm(&h.store, "doomed");
    h.reconciler.sync_vms().await.unwrap();

    // The controller drops one VM and assigns another.
    h.store.update(|txn| txn.delete_vm("doomed")).unwrap();
    assigned_vm(&h.store, "fresh");

    h.reconciler.sync_vms().await.unwrap();

    let calls = h.factory.calls();
    let stop = calls.iter().position(|c| c == "stop doomed").unwrap();
    let delete = calls.iter().position(|c| c == "delete doomed").unwrap();
    let create = calls.iter().position(|c| c == "create fresh").unwrap();
    assert!(stop < create, "stop must precede create: {calls:?}");
    assert!(delete < create, "delete must precede create: {calls:?}");
}

#[tokio::test]
async fn remote_failure_stops_the_local_instance() {
    let h = harness(MockDriverFactory::new());
    assigned_vm(&h.store, "a");
    h.reconciler.sync_vms().await.unwrap();

    h.store
        .update(|txn| {
            let mut vm = txn.get_vm("a")?;
            vm.status = VmStatus::Failed;
            vm.status_message = "worker went silent".into();
            txn.set_vm(vm)?;
            Ok(())
        })
        .unwrap();

    h.reconciler.sync_vms().await.unwrap();

    assert!(h.factory.calls().contains(&"stop a".to_owned()));
    let driver = h.factory.driver("a").unwrap();
    assert_eq!(driver.status(), DriverStatus::Stopped);
}

#[tokio::test]
async fn local_failure_is_reported_with_the_driver_error() {
    let h = harness(MockDriverFactory::new());
    assigned_vm(&h.store, "a");
    h.reconciler.sync_vms().await.unwrap();

    h.factory.driver("a").unwrap().set_error("disk exploded");
    h.reconciler.sync_vms().await.unwrap();

    let failed = vm(&h.store, "a");
    assert_eq!(failed.status, VmStatus::Failed);
    assert_eq!(failed.status_message, "disk exploded");
}

#[tokio::test]
async fn failed_create_is_reported() {
    let h = harness(MockDriverFactory::failing());
    assigned_vm(&h.store, "a");

    h.reconciler.sync_vms().await.unwrap();

    let failed = vm(&h.store, "a");
    assert_eq!(failed.status, VmStatus::Failed);
    assert!(failed.status_message.contains("mock factory configured to fail"));
}

#[tokio::test]
async fn running_vm_without_local_instance_is_lost() {
    let h = harness(MockDriverFactory::new());
    let stored = assigned_vm(&h.store, "a");
    h.store
        .update(|txn| {
            let mut vm = stored.clone();
            vm.status = VmStatus::Running;
            txn.set_vm(vm)?;
            Ok(())
        })
        .unwrap();

    h.reconciler.sync_vms().await.unwrap();

    let failed = vm(&h.store, "a");
    assert_eq!(failed.status, VmStatus::Failed);
    assert_eq!(failed.status_message, MSG_LOST_TRACK);
}

#[tokio::test]
async fn running_remote_with_booting_local_is_impossible() {
    let h = harness(MockDriverFactory::new().slow_boot());
    assigned_vm(&h.store, "a");
    h.reconciler.sync_vms().await.unwrap();

    // The local instance is still booting, but the record claims running.
    h.store
        .update(|txn| {
            let mut vm = txn.get_vm("a")?;
            vm.status = VmStatus::Running;
            txn.set_vm(vm)?;
            Ok(())
        })
        .unwrap();

    h.reconciler.sync_vms().await.unwrap();

    assert!(h.factory.calls().contains(&"stop a".to_owned()));
    let failed = vm(&h.store, "a");
    assert_eq!(failed.status, VmStatus::Failed);
    assert_eq!(failed.status_message, MSG_IMPOSSIBLE);
}

#[tokio::test]
async fn spec_change_recreates_the_instance() {
    let h = harness(MockDriverFactory::new());
    assigned_vm(&h.store, "a");
    h.reconciler.sync_vms().await.unwrap();
    h.reconciler.sync_vms().await.unwrap();
    assert_eq!(vm(&h.store, "a").status, VmStatus::Running);

    // A spec mutation bumps the generation.
    h.store
        .update(|txn| {
            let mut vm = txn.get_vm("a")?;
            vm.image = "ubuntu:next".into();
            vm.generation += 1;
            txn.set_vm(vm)?;
            Ok(())
        })
        .unwrap();

    h.reconciler.sync_vms().await.unwrap();

    let calls = h.factory.calls();
    let stop = calls.iter().rposition(|c| c == "stop a").unwrap();
    let recreate = calls.iter().rposition(|c| c == "create a").unwrap();
    let restart = calls.iter().rposition(|c| c == "start a").unwrap();
    assert!(stop < recreate && recreate < restart, "wrong order: {calls:?}");

    let respecced = vm(&h.store, "a");
    assert_eq!(respecced.status, VmStatus::Pending);
    assert_eq!(respecced.observed_generation, respecced.generation);

    // The next pass reports the re-created instance running again.
    h.reconciler.sync_vms().await.unwrap();
    assert_eq!(vm(&h.store, "a").status, VmStatus::Running);
}

#[tokio::test]
async fn on_disk_orphans_are_cleaned_up() {
    let mut known = Vm::new("known", "ubuntu:latest");
    known.worker = Some(WORKER.to_owned());
    known.status = VmStatus::Running;
    let known_uid = known.uid.clone();

    let factory = MockDriverFactory::new().with_on_disk(vec![
        OnDiskVm {
            name: "unmanaged".into(),
            uid: None,
            running: true,
        },
        OnDiskVm {
            name: "ghost".into(),
            uid: Some("no-such-uid".into()),
            running: true,
        },
        OnDiskVm {
            name: "known".into(),
            uid: Some(known_uid),
            running: true,
        },
    ]);
    let h = harness(factory);
    h.store.update(|txn| txn.set_vm(known.clone())).unwrap();

    h.reconciler.sync_on_disk().await.unwrap();

    let calls = h.factory.calls();
    assert!(calls.contains(&"stop-on-disk ghost".to_owned()));
    assert!(calls.contains(&"destroy-on-disk ghost".to_owned()));
    assert!(calls.contains(&"stop-on-disk known".to_owned()));
    assert!(!calls.iter().any(|c| c.contains("unmanaged")));

    let lost = vm(&h.store, "known");
    assert_eq!(lost.status, VmStatus::Failed);
    assert_eq!(lost.status_message, MSG_LOST_TRACK);
}

#[tokio::test]
async fn heartbeat_refreshes_last_seen() {
    let h = harness(MockDriverFactory::new());
    h.reconciler.register().await.unwrap();

    h.store
        .update(|txn| {
            let mut worker = txn.get_worker(WORKER)?;
            worker.last_seen = Utc::now() - chrono::Duration::seconds(120);
            txn.set_worker(worker)?;
            Ok(())
        })
        .unwrap();

    h.reconciler.heartbeat().await.unwrap();

    let worker: Worker = h.store.view(|txn| txn.get_worker(WORKER)).unwrap();
    assert!(!worker.offline(Duration::from_secs(30)));
}
