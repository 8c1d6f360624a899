use std::time::Duration;

use anyhow::Result;
use vmfleet_model::{Resources, RESOURCE_VMS};

use crate::engine::DEFAULT_VM_SLOTS;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub worker_name: String,
    pub sync_interval: Duration,
    pub vm_slots: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("VMFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let worker_name = std::env::var("VMFLEET_WORKER_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "worker".to_string());

        let sync_interval = std::env::var("VMFLEET_SYNC_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let vm_slots = std::env::var("VMFLEET_VM_SLOTS")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(DEFAULT_VM_SLOTS);

        Ok(Self {
            log_level,
            worker_name,
            sync_interval,
            vm_slots,
        })
    }

    pub fn resources(&self) -> Resources {
        Resources::from([(RESOURCE_VMS, self.vm_slots)])
    }
}
