//! Resource record types for the vmfleet platform.
//!
//! These are the desired+observed state records the controller persists
//! and workers converge against:
//!
//! - [`Vm`]: a virtual machine record (spec, status, placement).
//! - [`Worker`]: a host that runs VMs and heartbeats to the controller.
//! - [`ClusterSettings`]: cluster-wide scheduling configuration.
//! - [`WatchInstruction`]: out-of-band messages pushed to workers over
//!   their persistent watch channel.

mod condition;
mod labels;
mod resources;
mod settings;
mod vm;
mod watch;
mod worker;

pub use condition::VmCondition;
pub use labels::Labels;
pub use resources::{Resources, RESOURCE_VMS};
pub use settings::{ClusterSettings, HostDirPolicy, SchedulerProfile, UnsupportedProfileError};
pub use vm::{HostDir, ImagePullPolicy, PowerState, RestartPolicy, Vm, VmStatus};
pub use watch::{
    ExecAction, PortForwardAction, ResolveIpAction, SyncVmsAction, TerminalSize, WatchInstruction,
};
pub use worker::Worker;
