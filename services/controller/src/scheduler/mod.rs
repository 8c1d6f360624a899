//! VM placement and worker health checking.
//!
//! The scheduler runs one loop: each tick health-checks scheduled VMs
//! against the worker records, then places unscheduled VMs onto eligible
//! workers according to the cluster's placement profile. Placement
//! happens inside a single store transaction so a pass either fully
//! commits or leaves no trace; affected workers are nudged over their
//! watch channel afterwards so they pick the new VMs up without waiting
//! for their own poll interval.

mod worker_info;

pub use worker_info::{order_workers, WorkerInfo, WorkerInfos};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmfleet_model::{Resources, Vm, VmStatus, WatchInstruction, RESOURCE_VMS};
use vmfleet_model::{RestartPolicy, Worker};
use vmfleet_store::{Store, StoreError};
use vmfleet_tunnel::Notifier;

/// CPU count assigned to a VM that requests none and whose worker
/// carries no default.
pub const DEFAULT_VM_CPU: u64 = 4;

/// Memory (MB) assigned to a VM that requests none and whose worker
/// carries no default.
pub const DEFAULT_VM_MEMORY_MB: u64 = 8192;

/// Minimum time between automatic restarts of a failed VM.
const RESTART_BACKOFF: Duration = Duration::from_secs(15);

/// How long a post-pass sync nudge may block per worker.
const NOTIFY_BOUND: Duration = Duration::from_secs(1);

pub const MSG_WORKER_GONE: &str = "VM is assigned to a worker that doesn't exist anymore";
pub const MSG_WORKER_OFFLINE: &str =
    "VM is assigned to a worker that lost connection with the controller";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub worker_offline_timeout: Duration,
    /// CPU fallback for VMs whose spec and worker both carry none.
    pub default_vm_cpu: u64,
    /// Memory (MB) fallback for VMs whose spec and worker both carry none.
    pub default_vm_memory_mb: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: Duration::from_secs(5),
            worker_offline_timeout: Duration::from_secs(30),
            default_vm_cpu: DEFAULT_VM_CPU,
            default_vm_memory_mb: DEFAULT_VM_MEMORY_MB,
        }
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    notifier: Notifier<WatchInstruction>,
    config: SchedulerConfig,
    wakeup: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        notifier: Notifier<WatchInstruction>,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            store,
            notifier,
            config,
            wakeup: Notify::new(),
        }
    }

    /// Run the scheduling loop until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting scheduler"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = self.wakeup.notified() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Ask for an immediate pass. Requests coalesce: at most one extra
    /// pass is queued regardless of how often this is called.
    pub fn request_scheduling(&self) {
        self.wakeup.notify_one();
    }

    async fn tick(&self) {
        if let Err(e) = self.health_check() {
            error!(error = %e, "Health-check pass failed");
        }
        match self.schedule() {
            Ok(affected) => self.notify_workers(affected).await,
            Err(e) => error!(error = %e, "Scheduling pass failed"),
        }
    }

    /// Fail VMs whose worker disappeared or went silent, and re-queue
    /// failed VMs whose restart policy asks for another attempt.
    ///
    /// Each VM is its own transaction so one conflicting record cannot
    /// starve the rest of the pass. Already-failed VMs (outside the
    /// restart case) are skipped without a write, keeping the pass
    /// idempotent.
    pub fn health_check(&self) -> Result<(), SchedulerError> {
        let names: Vec<String> = self
            .store
            .view(|txn| Ok(txn.list_vms()?.into_iter().map(|vm| vm.name).collect()))?;

        for name in names {
            let changed = self.store.update(|txn| {
                let vm = match txn.get_vm(&name) {
                    Ok(vm) => vm,
                    Err(StoreError::NotFound) => return Ok(None),
                    Err(e) => return Err(e),
                };
                self.check_vm(txn, vm)
            })?;

            if let Some(message) = changed {
                info!(vm = %name, %message, "Health check updated VM");
            }
        }
        Ok(())
    }

    fn check_vm(
        &self,
        txn: &mut vmfleet_store::Txn,
        mut vm: Vm,
    ) -> Result<Option<String>, StoreError> {
        if vm.status == VmStatus::Failed {
            if vm.restart_policy == RestartPolicy::OnFailure && self.restart_due(&vm) {
                vm.status = VmStatus::Pending;
                vm.status_message.clear();
                vm.worker = None;
                vm.scheduled_at = None;
                vm.started_at = None;
                vm.assigned_cpu = 0;
                vm.assigned_memory = 0;
                vm.image_fqn = None;
                vm.conditions.clear();
                vm.restart_count += 1;
                vm.restarted_at = Some(Utc::now());
                txn.set_vm(vm)?;
                return Ok(Some("restarting failed VM".to_owned()));
            }
            return Ok(None);
        }

        let Some(worker_name) = vm.worker.clone() else {
            return Ok(None);
        };

        let message = match txn.get_worker(&worker_name) {
            Err(StoreError::NotFound) => MSG_WORKER_GONE,
            Ok(worker) if worker.offline(self.config.worker_offline_timeout) => MSG_WORKER_OFFLINE,
            Ok(_) => return Ok(None),
            Err(e) => return Err(e),
        };

        vm.status = VmStatus::Failed;
        vm.status_message = message.to_owned();
        txn.set_vm(vm)?;
        Ok(Some(message.to_owned()))
    }

    fn restart_due(&self, vm: &Vm) -> bool {
        let backoff = chrono::Duration::from_std(RESTART_BACKOFF).unwrap_or(chrono::Duration::MAX);
        vm.restarted_at
            .is_none_or(|restarted_at| Utc::now() - restarted_at >= backoff)
    }

    /// Place unscheduled VMs, oldest first, onto eligible workers.
    ///
    /// Runs as one transaction; returns the names of workers that
    /// received at least one VM.
    pub fn schedule(&self) -> Result<Vec<String>, SchedulerError> {
        let affected = self.store.update(|txn| {
            let settings = txn.get_cluster_settings()?;
            let workers = txn.list_workers()?;

            let mut infos = WorkerInfos::new();
            let mut unscheduled = Vec::new();
            for vm in txn.list_vms()? {
                if vm.is_terminal() {
                    continue;
                }
                match &vm.worker {
                    Some(worker) => infos.account(worker, &effective_resources(&vm)),
                    None => unscheduled.push(vm),
                }
            }
            unscheduled.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.name.cmp(&b.name))
            });

            let mut affected: Vec<String> = Vec::new();
            for mut vm in unscheduled {
                let requested = effective_resources(&vm);

                let mut candidates = workers.clone();
                order_workers(settings.scheduler_profile, &mut candidates, &infos);

                let Some(worker) = candidates
                    .iter()
                    .find(|w| self.eligible(w, &vm, &requested, &infos))
                else {
                    debug!(vm = %vm.name, "No eligible worker for VM");
                    continue;
                };

                vm.assigned_cpu = pick(vm.cpu, worker.default_cpu, self.config.default_vm_cpu);
                vm.assigned_memory =
                    pick(vm.memory, worker.default_memory, self.config.default_vm_memory_mb);
                vm.worker = Some(worker.name.clone());
                vm.scheduled_at = Some(Utc::now());

                let name = worker.name.clone();
                let vm = txn.set_vm(vm)?;
                infos.account(&name, &requested);
                info!(vm = %vm.name, worker = %name, "Scheduled VM");
                affected.push(name);
            }

            affected.sort();
            affected.dedup();
            Ok(affected)
        })?;
        Ok(affected)
    }

    fn eligible(&self, worker: &Worker, vm: &Vm, requested: &Resources, infos: &WorkerInfos) -> bool {
        worker.labels.contains(&vm.labels)
            && !worker.scheduling_paused
            && !worker.offline(self.config.worker_offline_timeout)
            && worker
                .resources
                .subtracted(&infos.resources_used(&worker.name))
                .can_fit(requested)
    }

    /// Nudge each affected worker to sync immediately. Best-effort: a
    /// worker that misses the nudge catches up on its next poll.
    async fn notify_workers(&self, workers: Vec<String>) {
        for worker in workers {
            let caller = CancellationToken::new();
            let notified = tokio::time::timeout(
                NOTIFY_BOUND,
                self.notifier
                    .notify(&caller, &worker, WatchInstruction::sync_vms()),
            )
            .await;
            match notified {
                Ok(Ok(())) => debug!(%worker, "Nudged worker to sync VMs"),
                Ok(Err(e)) => warn!(%worker, error = %e, "Worker sync nudge failed"),
                Err(_) => {
                    caller.cancel();
                    debug!(%worker, "Worker sync nudge timed out");
                }
            }
        }
    }
}

/// The resources a VM occupies on its worker. Every VM takes one VM
/// slot unless its spec asks for a different amount.
fn effective_resources(vm: &Vm) -> Resources {
    vm.resources.merged(&Resources::from([(RESOURCE_VMS, 1)]))
}

fn pick(requested: u64, worker_default: u64, fallback: u64) -> u64 {
    if requested > 0 {
        requested
    } else if worker_default > 0 {
        worker_default
    } else {
        fallback
    }
}
