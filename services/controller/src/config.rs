use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub scheduler_interval: Duration,
    pub worker_offline_timeout: Duration,
    pub default_vm_cpu: u64,
    pub default_vm_memory_mb: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("VMFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let scheduler_interval = std::env::var("VMFLEET_SCHEDULER_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let worker_offline_timeout = std::env::var("VMFLEET_WORKER_OFFLINE_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        let default_vm_cpu = std::env::var("VMFLEET_DEFAULT_VM_CPU")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(crate::scheduler::DEFAULT_VM_CPU);

        let default_vm_memory_mb = std::env::var("VMFLEET_DEFAULT_VM_MEMORY_MB")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(crate::scheduler::DEFAULT_VM_MEMORY_MB);

        Ok(Self {
            log_level,
            scheduler_interval,
            worker_offline_timeout,
            default_vm_cpu,
            default_vm_memory_mb,
        })
    }
}
