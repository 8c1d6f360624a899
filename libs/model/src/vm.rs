//! The VM record: desired spec plus observed status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Labels, Resources, VmCondition};

/// Observed lifecycle status of a VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    #[default]
    Pending,
    Running,
    Failed,
}

impl VmStatus {
    /// Terminal statuses are final: the scheduler and workers never move
    /// a VM out of them (the restart policy re-creates the record fields
    /// instead).
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Failed)
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Pending => write!(f, "pending"),
            VmStatus::Running => write!(f, "running"),
            VmStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What the controller should do when a VM fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
}

/// Desired power state of a VM after a spec change is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    Running,
    Stopped,
}

/// When the worker should pull the VM image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    #[default]
    IfNotPresent,
    Always,
}

/// A host directory mounted into the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDir {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A virtual machine record.
///
/// The spec fields are written by API clients; `generation` increments on
/// every spec mutation. The status fields are written by the scheduler
/// (placement, health-check failures) and the assigned worker (observed
/// state). `observed_generation` is copied back by the worker only after
/// it has applied that generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vm {
    // Identity
    pub name: String,
    pub uid: String,
    pub created_at: DateTime<Utc>,

    // Spec
    pub image: String,
    pub cpu: u64,
    pub memory: u64,
    pub resources: Resources,
    pub labels: Labels,
    pub net_softnet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_bridged: Option<String>,
    pub host_dirs: Vec<HostDir>,
    pub image_pull_policy: ImagePullPolicy,
    pub restart_policy: RestartPolicy,
    pub power_state: PowerState,
    pub generation: u64,

    // Status
    pub status: VmStatus,
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_fqn: Option<String>,
    pub conditions: Vec<VmCondition>,
    pub observed_generation: u64,

    // Placement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub assigned_cpu: u64,
    pub assigned_memory: u64,

    // Restart bookkeeping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,
    pub restart_count: u64,

    // Store-assigned, monotonically increasing on every write
    pub version: u64,
}

impl Vm {
    /// A fresh pending VM record with a generated UID.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Vm {
            name: name.into(),
            uid: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            image: image.into(),
            generation: 1,
            ..Vm::default()
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
