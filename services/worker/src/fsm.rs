//! The reconciliation decision table.
//!
//! Each pass compares the controller's view of a VM (remote) with the
//! driver's view (local) and picks one action. Both sides range over
//! absent/pending/running/failed, so the table is a total function over
//! sixteen combinations.

use vmfleet_model::VmStatus;

/// What to do about one (remote, local) VM pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to converge.
    Ignore,
    /// Remote wants the VM; no local instance yet.
    Create,
    /// Booting; keep the remote status message fresh.
    MonitorPending,
    /// Local came up; tell the controller.
    ReportRunning,
    /// Both running; watch for spec changes and status drift.
    MonitorRunning,
    /// Remote already failed; release local resources.
    Stop,
    /// Local failed; propagate the driver's error.
    Fail,
    /// Remote thinks it runs here, but there is no local instance.
    LostTrack,
    /// Remote running while local still boots: state skew that should
    /// never happen.
    Impossible,
    /// Remote record is gone; tear the local instance down.
    Delete,
}

/// Pick the action for a (remote, local) pair. `None` means that side
/// has no record of the VM.
pub fn transition(remote: Option<VmStatus>, local: Option<VmStatus>) -> Action {
    use VmStatus::{Failed, Pending, Running};

    match (remote, local) {
        (None, None) => Action::Ignore,
        (None, Some(_)) => Action::Delete,

        (Some(Pending), None) => Action::Create,
        (Some(Pending), Some(Pending)) => Action::MonitorPending,
        (Some(Pending), Some(Running)) => Action::ReportRunning,
        (Some(Pending), Some(Failed)) => Action::Fail,

        (Some(Running), None) => Action::LostTrack,
        (Some(Running), Some(Pending)) => Action::Impossible,
        (Some(Running), Some(Running)) => Action::MonitorRunning,
        (Some(Running), Some(Failed)) => Action::Fail,

        (Some(Failed), None) => Action::Ignore,
        (Some(Failed), Some(Pending)) => Action::Stop,
        (Some(Failed), Some(Running)) => Action::Stop,
        (Some(Failed), Some(Failed)) => Action::Ignore,
    }
}

/// Pairs whose remote side is absent or failed free up capacity, so a
/// pass handles them before anything that might consume capacity.
pub fn releases_resources(remote: Option<VmStatus>) -> bool {
    matches!(remote, None | Some(VmStatus::Failed))
}
