//! Cluster-wide scheduling settings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Controls the order in which the scheduler considers workers.
///
/// The profile never changes the fit test, only iteration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerProfile {
    /// Pack one worker full before using the next.
    #[default]
    OptimizeUtilization,
    /// Spread VMs across workers evenly.
    DistributeLoad,
}

#[derive(Debug, Error)]
#[error("unsupported scheduler profile: {0:?}")]
pub struct UnsupportedProfileError(String);

impl std::str::FromStr for SchedulerProfile {
    type Err = UnsupportedProfileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "optimize-utilization" => Ok(SchedulerProfile::OptimizeUtilization),
            "distribute-load" => Ok(SchedulerProfile::DistributeLoad),
            other => Err(UnsupportedProfileError(other.to_string())),
        }
    }
}

/// Policy governing which host directories workers may mount into VMs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDirPolicy {
    pub path_prefix: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Global settings read once per scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub scheduler_profile: SchedulerProfile,
    pub host_dir_policies: Vec<HostDirPolicy>,
}
