//! vmfleet worker library.
//!
//! The worker registers itself with the controller, heartbeats, and
//! runs a reconciliation engine that converges the local driver state
//! onto the controller's VM records. Instructions pushed over the watch
//! channel trigger immediate syncs and IP resolution callbacks.

pub mod client;
pub mod config;
pub mod driver;
pub mod engine;
pub mod fsm;
pub mod instructions;

pub use client::{ControllerClient, MockController};
pub use config::Config;
pub use driver::{DriverError, DriverFactory, DriverStatus, MockDriverFactory, OnDiskVm, VmDriver};
pub use engine::{Reconciler, ReconcilerConfig};
pub use instructions::InstructionHandler;
