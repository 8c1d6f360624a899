//! Reconciliation engine: converges local driver state onto the
//! controller's VM records.
//!
//! Each pass fetches the VMs assigned to this worker, pairs them with
//! the locally tracked instances by UID, and runs one decision-table
//! action per pair. Pairs whose remote side is gone or failed are
//! handled first so capacity frees up before new VMs are created in the
//! same pass.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmfleet_model::{PowerState, Resources, Vm, VmStatus, Worker, RESOURCE_VMS};

use crate::client::{ClientError, ControllerClient};
use crate::driver::{DriverError, DriverFactory, DriverStatus, VmDriver};
use crate::fsm::{releases_resources, transition, Action};

pub const MSG_LOST_TRACK: &str = "Worker lost track of VM";
pub const MSG_IMPOSSIBLE: &str = "Encountered an impossible transition";

/// VM slots advertised when the operator configures nothing.
pub const DEFAULT_VM_SLOTS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub worker_name: String,
    pub machine_id: String,
    pub resources: Resources,
    pub sync_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            worker_name: "worker".to_owned(),
            machine_id: String::new(),
            resources: Resources::from([(RESOURCE_VMS, DEFAULT_VM_SLOTS)]),
            sync_interval: Duration::from_secs(5),
        }
    }
}

/// A VM instance this worker is tracking.
struct LocalVm {
    /// The spec as last applied to the driver.
    vm: Vm,
    driver: Arc<dyn VmDriver>,
    /// Mid spec-change: the old instance is winding down and must keep
    /// matching the remote's running view until it is re-created.
    respec: bool,
}

impl LocalVm {
    fn status(&self) -> VmStatus {
        if self.respec {
            VmStatus::Running
        } else {
            self.driver.status().vm_status()
        }
    }
}

pub struct Reconciler {
    client: Arc<dyn ControllerClient>,
    factory: Arc<dyn DriverFactory>,
    config: ReconcilerConfig,
    local: Mutex<BTreeMap<String, LocalVm>>,
    sync_requested: Notify,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ControllerClient>,
        factory: Arc<dyn DriverFactory>,
        config: ReconcilerConfig,
    ) -> Self {
        Reconciler {
            client,
            factory,
            config,
            local: Mutex::new(BTreeMap::new()),
            sync_requested: Notify::new(),
        }
    }

    /// Run the reconciliation loop until shutdown is signaled.
    ///
    /// Registration happens first; a failure there is fatal since the
    /// worker has no identity to reconcile under.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let worker = self.register().await?;
        info!(worker = %worker.name, "Worker registered");

        if let Err(e) = self.sync_on_disk().await {
            warn!(error = %e, "On-disk reconciliation failed");
        }

        let mut interval = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                    if let Err(e) = self.sync_vms().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
                _ = self.sync_requested.notified() => {
                    if let Err(e) = self.sync_vms().await {
                        error!(error = %e, "Requested reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask for an immediate pass. Requests coalesce.
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    pub async fn register(&self) -> Result<Worker, EngineError> {
        let mut worker = Worker::new(self.config.worker_name.clone(), self.config.resources.clone());
        worker.machine_id = self.config.machine_id.clone();
        Ok(self.client.register_worker(worker).await?)
    }

    /// Refresh `last_seen` so the scheduler keeps considering us online.
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        let mut worker = self.client.get_worker(&self.config.worker_name).await?;
        worker.last_seen = Utc::now();
        self.client.update_worker(worker).await?;
        Ok(())
    }

    /// Resolve the IP of a locally tracked VM (for a resolve-IP
    /// instruction).
    pub async fn resolve_ip(
        &self,
        caller: &CancellationToken,
        vm_uid: &str,
    ) -> Result<String, DriverError> {
        let driver = {
            let local = self.local.lock().await;
            local.get(vm_uid).map(|entry| Arc::clone(&entry.driver))
        };
        match driver {
            Some(driver) => driver.ip(caller).await,
            None => Err(DriverError::Failed(format!(
                "worker is not tracking VM {vm_uid:?}"
            ))),
        }
    }

    /// One reconciliation pass over all (remote, local) pairs.
    pub async fn sync_vms(&self) -> Result<(), EngineError> {
        let remote_vms = self.client.vms_for_worker(&self.config.worker_name).await?;
        let mut remote_by_uid: HashMap<String, Vm> = remote_vms
            .into_iter()
            .map(|vm| (vm.uid.clone(), vm))
            .collect();

        let mut local = self.local.lock().await;

        let mut uids: BTreeSet<String> = remote_by_uid.keys().cloned().collect();
        uids.extend(local.keys().cloned());

        // Resource-releasing pairs first, remaining order stable by UID.
        let mut uids: Vec<String> = uids.into_iter().collect();
        uids.sort_by_key(|uid| {
            let remote_status = remote_by_uid.get(uid).map(|vm| vm.status);
            (!releases_resources(remote_status), uid.clone())
        });

        for uid in uids {
            let remote = remote_by_uid.remove(&uid);
            let remote_status = remote.as_ref().map(|vm| vm.status);
            let local_status = local.get(&uid).map(LocalVm::status);
            let action = transition(remote_status, local_status);
            debug!(vm_uid = %uid, ?remote_status, ?local_status, ?action, "Reconciling VM");

            match action {
                Action::Ignore => {}
                Action::Create => {
                    if let Some(vm) = remote {
                        self.create(&mut local, vm).await;
                    }
                }
                Action::MonitorPending => {
                    if let (Some(vm), Some(entry)) = (remote, local.get_mut(&uid)) {
                        self.monitor_pending(entry, vm).await;
                    }
                }
                Action::ReportRunning => {
                    if let (Some(vm), Some(entry)) = (remote, local.get_mut(&uid)) {
                        self.report_running(entry, vm).await;
                    }
                }
                Action::MonitorRunning => {
                    if let (Some(vm), Some(entry)) = (remote, local.get_mut(&uid)) {
                        self.monitor_running(entry, vm).await;
                    }
                }
                Action::Stop => {
                    if let Some(entry) = local.get_mut(&uid) {
                        entry.respec = false;
                        if let Err(e) = entry.driver.stop().await {
                            warn!(vm_uid = %uid, error = %e, "Stopping failed VM's instance failed");
                        }
                    }
                }
                Action::Fail => {
                    if let (Some(vm), Some(entry)) = (remote, local.get_mut(&uid)) {
                        self.fail(entry, vm).await;
                    }
                }
                Action::LostTrack => {
                    if let Some(vm) = remote {
                        self.report_failure(vm, MSG_LOST_TRACK).await;
                    }
                }
                Action::Impossible => {
                    if let (Some(vm), Some(entry)) = (remote, local.get_mut(&uid)) {
                        warn!(vm = %vm.name, "Remote reports running while local instance still boots");
                        if let Err(e) = entry.driver.stop().await {
                            warn!(vm = %vm.name, error = %e, "Stopping skewed VM failed");
                        }
                        self.report_failure(vm, MSG_IMPOSSIBLE).await;
                    }
                }
                Action::Delete => {
                    if let Some(entry) = local.remove(&uid) {
                        if let Err(e) = entry.driver.stop().await {
                            warn!(vm_uid = %uid, error = %e, "Stopping deleted VM failed");
                        }
                        if let Err(e) = entry.driver.delete().await {
                            warn!(vm_uid = %uid, error = %e, "Deleting VM instance failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Clean up instances left on disk by a previous run.
    ///
    /// Unmanaged instances are ignored. Managed instances unknown to
    /// the controller are destroyed; instances the controller believes
    /// are past pending but which we are not tracking get stopped and
    /// reported as lost.
    pub async fn sync_on_disk(&self) -> Result<(), EngineError> {
        let on_disk = self.factory.list_on_disk().await?;
        if on_disk.is_empty() {
            return Ok(());
        }
        let remote_vms = self.client.vms_for_worker(&self.config.worker_name).await?;
        let local = self.local.lock().await;

        for instance in on_disk {
            let Some(uid) = instance.uid else {
                continue;
            };
            match remote_vms.iter().find(|vm| vm.uid == uid) {
                None => {
                    info!(name = %instance.name, "Destroying orphaned VM instance");
                    if instance.running {
                        if let Err(e) = self.factory.stop_on_disk(&instance.name).await {
                            warn!(name = %instance.name, error = %e, "Stopping orphan failed");
                        }
                    }
                    if let Err(e) = self.factory.destroy_on_disk(&instance.name).await {
                        warn!(name = %instance.name, error = %e, "Destroying orphan failed");
                    }
                }
                Some(vm) if vm.status != VmStatus::Pending && !local.contains_key(&uid) => {
                    info!(vm = %vm.name, "Found untracked instance for a non-pending VM");
                    if let Err(e) = self.factory.stop_on_disk(&instance.name).await {
                        warn!(name = %instance.name, error = %e, "Stopping untracked instance failed");
                    }
                    self.report_failure(vm.clone(), MSG_LOST_TRACK).await;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn create(&self, local: &mut BTreeMap<String, LocalVm>, vm: Vm) {
        match self.factory.create(&vm).await {
            Ok(driver) => {
                if vm.power_state == PowerState::Running {
                    if let Err(e) = driver.start().await {
                        warn!(vm = %vm.name, error = %e, "Starting VM failed");
                    }
                }
                local.insert(
                    vm.uid.clone(),
                    LocalVm {
                        vm,
                        driver,
                        respec: false,
                    },
                );
            }
            Err(e) => {
                warn!(vm = %vm.name, error = %e, "Creating VM failed");
                self.report_failure(vm, &e.to_string()).await;
            }
        }
    }

    async fn monitor_pending(&self, entry: &mut LocalVm, remote: Vm) {
        if remote.generation != remote.observed_generation {
            self.respec(entry, remote).await;
            return;
        }

        let message = entry.driver.status_message();
        if message != remote.status_message {
            let mut vm = remote;
            vm.status_message = message;
            self.push_update(vm).await;
        }
    }

    async fn report_running(&self, entry: &mut LocalVm, remote: Vm) {
        let mut vm = remote;
        vm.status = VmStatus::Running;
        vm.status_message = entry.driver.status_message();
        if let Some(fqn) = entry.driver.image_fqn() {
            vm.image_fqn = Some(fqn);
        }
        vm.started_at = Some(Utc::now());
        vm.observed_generation = entry.vm.generation;
        self.push_update(vm).await;
    }

    async fn monitor_running(&self, entry: &mut LocalVm, remote: Vm) {
        if remote.generation != remote.observed_generation {
            self.respec(entry, remote).await;
            return;
        }

        let message = entry.driver.status_message();
        let conditions = entry.driver.conditions();
        if message != remote.status_message || conditions != remote.conditions {
            let mut vm = remote;
            vm.status_message = message;
            vm.conditions = conditions;
            self.push_update(vm).await;
        }
    }

    /// Apply a spec change: wind the old instance down, and once it is
    /// fully stopped re-create it from the new spec.
    ///
    /// Spans passes. While the old instance stops, `respec` keeps the
    /// pair in the monitoring arm; after re-creation the VM goes back
    /// through the normal pending flow.
    async fn respec(&self, entry: &mut LocalVm, remote: Vm) {
        if entry.driver.status() != DriverStatus::Stopped {
            entry.respec = remote.status == VmStatus::Running;
            // Suspend preserves the guest when we intend to resume it.
            let result = if entry.driver.suspendable() && remote.power_state == PowerState::Running
            {
                entry.driver.suspend().await
            } else {
                entry.driver.stop().await
            };
            if let Err(e) = result {
                warn!(vm = %remote.name, error = %e, "Winding down VM for spec change failed");
            }
            if entry.driver.status() != DriverStatus::Stopped {
                return;
            }
        }

        match self.factory.create(&remote).await {
            Ok(driver) => {
                if remote.power_state == PowerState::Running {
                    if let Err(e) = driver.start().await {
                        warn!(vm = %remote.name, error = %e, "Restarting VM after spec change failed");
                    }
                }
                entry.driver = driver;
                entry.vm = remote.clone();
                entry.respec = false;

                let mut vm = remote;
                vm.observed_generation = vm.generation;
                vm.status = VmStatus::Pending;
                vm.started_at = None;
                vm.status_message = entry.driver.status_message();
                self.push_update(vm).await;
            }
            Err(e) => {
                warn!(vm = %remote.name, error = %e, "Re-creating VM after spec change failed");
                entry.respec = false;
                self.report_failure(remote, &e.to_string()).await;
            }
        }
    }

    async fn fail(&self, entry: &mut LocalVm, remote: Vm) {
        entry.respec = false;
        if let Err(e) = entry.driver.stop().await {
            warn!(vm = %remote.name, error = %e, "Stopping failed VM failed");
        }
        let message = entry
            .driver
            .error()
            .unwrap_or_else(|| "VM failed".to_owned());
        self.report_failure(remote, &message).await;
    }

    async fn report_failure(&self, mut vm: Vm, message: &str) {
        vm.status = VmStatus::Failed;
        vm.status_message = message.to_owned();
        self.push_update(vm).await;
    }

    async fn push_update(&self, vm: Vm) {
        if let Err(e) = self.client.update_vm(vm.clone()).await {
            // The record moved under us; the next pass sees the new copy.
            warn!(vm = %vm.name, error = %e, "Pushing VM update failed");
        }
    }
}
