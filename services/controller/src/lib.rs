//! vmfleet controller library.
//!
//! Hosts the scheduler (placement + health checks) and the tunnel
//! broker that pairs API-side requests with worker callbacks. The
//! store and tunnel primitives live in their own crates so both the
//! controller and tests can share them.

pub mod config;
pub mod scheduler;
pub mod tunnel;

pub use config::Config;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
pub use tunnel::{ExecSpec, TunnelBroker, TunnelConn, TunnelError, WorkerReply};
