//! Per-worker occupancy accounting for a scheduling pass.

use std::collections::BTreeMap;

use vmfleet_model::{Resources, SchedulerProfile, Worker};

/// What one worker currently carries.
#[derive(Debug, Clone, Default)]
pub struct WorkerInfo {
    pub resources_used: Resources,
    pub vm_count: u64,
}

/// Occupancy accumulator keyed by worker name.
///
/// Seeded from the already-scheduled VMs at the start of a pass, then
/// updated as the pass places further VMs so later placement decisions
/// see the earlier ones.
#[derive(Debug, Default)]
pub struct WorkerInfos(BTreeMap<String, WorkerInfo>);

impl WorkerInfos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&mut self, worker: &str, resources: &Resources) {
        let info = self.0.entry(worker.to_owned()).or_default();
        info.resources_used.add(resources);
        info.vm_count += 1;
    }

    pub fn resources_used(&self, worker: &str) -> Resources {
        self.0
            .get(worker)
            .map(|info| info.resources_used.clone())
            .unwrap_or_default()
    }

    pub fn vm_count(&self, worker: &str) -> u64 {
        self.0.get(worker).map(|info| info.vm_count).unwrap_or(0)
    }
}

/// Sort candidate workers according to the cluster's placement profile.
///
/// `optimize-utilization` packs VMs onto the busiest workers first,
/// `distribute-load` spreads them onto the emptiest. Equal occupancy is
/// broken by worker name so a pass is deterministic.
pub fn order_workers(profile: SchedulerProfile, workers: &mut [Worker], infos: &WorkerInfos) {
    match profile {
        SchedulerProfile::OptimizeUtilization => {
            workers.sort_by(|a, b| {
                infos
                    .vm_count(&b.name)
                    .cmp(&infos.vm_count(&a.name))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        SchedulerProfile::DistributeLoad => {
            workers.sort_by(|a, b| {
                infos
                    .vm_count(&a.name)
                    .cmp(&infos.vm_count(&b.name))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
    }
}
