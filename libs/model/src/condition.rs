//! Observed conditions reported by the worker alongside the VM status.

use serde::{Deserialize, Serialize};

/// A single named condition, e.g. `{"name": "Running", "status": true}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCondition {
    pub name: String,
    pub status: bool,
}

impl VmCondition {
    pub fn new(name: impl Into<String>, status: bool) -> Self {
        VmCondition {
            name: name.into(),
            status,
        }
    }
}
