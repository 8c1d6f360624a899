//! The worker record: a host that runs VMs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Labels, Resources};

/// A worker host registered with the controller.
///
/// `last_seen` is refreshed by the worker's heartbeat; the scheduler
/// treats a worker as offline once the heartbeat goes stale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Worker {
    pub name: String,
    pub machine_id: String,
    pub resources: Resources,
    pub labels: Labels,
    pub last_seen: DateTime<Utc>,
    pub scheduling_paused: bool,

    /// Defaults applied to VMs scheduled here without explicit CPU/memory.
    pub default_cpu: u64,
    pub default_memory: u64,

    // Store-assigned, monotonically increasing on every write
    pub version: u64,
}

impl Worker {
    pub fn new(name: impl Into<String>, resources: Resources) -> Self {
        Worker {
            name: name.into(),
            resources,
            last_seen: Utc::now(),
            ..Worker::default()
        }
    }

    /// Whether this worker's heartbeat is older than `timeout`.
    pub fn offline(&self, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Utc::now() - self.last_seen > timeout
    }
}
