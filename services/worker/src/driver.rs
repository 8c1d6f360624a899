//! VM driver interface and mock implementation.
//!
//! The driver abstracts the local virtualization backend: creating,
//! booting, stopping, and destroying VM instances, plus on-disk
//! discovery of instances left behind by a previous run. A mock
//! implementation is provided for testing and development; it records
//! every lifecycle call so tests can assert on ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vmfleet_model::{Vm, VmCondition, VmStatus};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver error: {0}")]
    Failed(String),
}

/// Lifecycle state as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// Pulling the image, cloning the disk, or booting.
    Creating,
    Stopped,
    Running,
    Failed,
}

impl DriverStatus {
    /// The remote-facing status this driver state maps to.
    pub fn vm_status(self) -> VmStatus {
        match self {
            DriverStatus::Creating | DriverStatus::Stopped => VmStatus::Pending,
            DriverStatus::Running => VmStatus::Running,
            DriverStatus::Failed => VmStatus::Failed,
        }
    }
}

/// A single local VM instance.
///
/// Lifecycle calls are idempotent where the backend allows it; status
/// accessors never block.
#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn suspend(&self) -> Result<(), DriverError>;
    async fn stop(&self) -> Result<(), DriverError>;
    async fn delete(&self) -> Result<(), DriverError>;

    /// Resolve the guest IP, waiting until `caller` is cancelled.
    async fn ip(&self, caller: &CancellationToken) -> Result<String, DriverError>;

    fn status(&self) -> DriverStatus;
    fn status_message(&self) -> String;
    fn conditions(&self) -> Vec<VmCondition>;

    /// The error that moved the driver into [`DriverStatus::Failed`].
    fn error(&self) -> Option<String>;

    /// Fully-qualified image reference once resolved.
    fn image_fqn(&self) -> Option<String>;

    /// Whether this backend can suspend instead of a cold stop.
    fn suspendable(&self) -> bool;
}

/// A VM instance found on disk before any driver was created for it.
#[derive(Debug, Clone)]
pub struct OnDiskVm {
    pub name: String,
    /// Fleet UID, if the instance is managed by us.
    pub uid: Option<String>,
    pub running: bool,
}

/// Creates drivers and manages instances not yet (or no longer) tracked
/// by a driver.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, vm: &Vm) -> Result<Arc<dyn VmDriver>, DriverError>;
    async fn list_on_disk(&self) -> Result<Vec<OnDiskVm>, DriverError>;
    async fn stop_on_disk(&self, name: &str) -> Result<(), DriverError>;
    async fn destroy_on_disk(&self, name: &str) -> Result<(), DriverError>;
}

/// Shared call journal for asserting lifecycle ordering in tests.
pub type CallJournal = Arc<Mutex<Vec<String>>>;

fn record(journal: &CallJournal, entry: String) {
    journal
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(entry);
}

/// Mock driver for testing and development.
pub struct MockDriver {
    name: String,
    journal: CallJournal,
    state: Mutex<MockDriverState>,
    suspendable: bool,
    /// Jump straight to `Running` on start instead of `Creating`.
    instant_boot: bool,
}

#[derive(Debug, Clone, Default)]
struct MockDriverState {
    status: Option<DriverStatus>,
    status_message: String,
    error: Option<String>,
    image_fqn: Option<String>,
    conditions: Vec<VmCondition>,
}

impl MockDriver {
    fn state(&self) -> std::sync::MutexGuard<'_, MockDriverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_status(&self, status: DriverStatus) {
        self.state().status = Some(status);
    }

    pub fn set_status_message(&self, message: impl Into<String>) {
        self.state().status_message = message.into();
    }

    pub fn set_error(&self, error: impl Into<String>) {
        let mut state = self.state();
        state.status = Some(DriverStatus::Failed);
        state.error = Some(error.into());
    }

    pub fn set_image_fqn(&self, fqn: impl Into<String>) {
        self.state().image_fqn = Some(fqn.into());
    }

    pub fn set_conditions(&self, conditions: Vec<VmCondition>) {
        self.state().conditions = conditions;
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    async fn start(&self) -> Result<(), DriverError> {
        record(&self.journal, format!("start {}", self.name));
        let mut state = self.state();
        if state.status.is_none() {
            state.status = Some(if self.instant_boot {
                DriverStatus::Running
            } else {
                DriverStatus::Creating
            });
        }
        Ok(())
    }

    async fn suspend(&self) -> Result<(), DriverError> {
        record(&self.journal, format!("suspend {}", self.name));
        self.state().status = Some(DriverStatus::Stopped);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        record(&self.journal, format!("stop {}", self.name));
        let mut state = self.state();
        if state.status != Some(DriverStatus::Failed) {
            state.status = Some(DriverStatus::Stopped);
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), DriverError> {
        record(&self.journal, format!("delete {}", self.name));
        Ok(())
    }

    async fn ip(&self, _caller: &CancellationToken) -> Result<String, DriverError> {
        match self.state().status {
            Some(DriverStatus::Running) => Ok("10.0.0.2".to_owned()),
            _ => Err(DriverError::Failed("VM has no IP yet".to_owned())),
        }
    }

    fn status(&self) -> DriverStatus {
        self.state().status.unwrap_or(DriverStatus::Stopped)
    }

    fn status_message(&self) -> String {
        self.state().status_message.clone()
    }

    fn conditions(&self) -> Vec<VmCondition> {
        self.state().conditions.clone()
    }

    fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    fn image_fqn(&self) -> Option<String> {
        self.state().image_fqn.clone()
    }

    fn suspendable(&self) -> bool {
        self.suspendable
    }
}

/// Mock factory for testing and development.
///
/// Hands out [`MockDriver`]s that share one call journal, and keeps the
/// drivers reachable by VM name so tests can poke their state.
pub struct MockDriverFactory {
    journal: CallJournal,
    drivers: Mutex<HashMap<String, Arc<MockDriver>>>,
    on_disk: Mutex<Vec<OnDiskVm>>,
    suspendable: bool,
    instant_boot: bool,
    fail_creates: bool,
}

impl MockDriverFactory {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            drivers: Mutex::new(HashMap::new()),
            on_disk: Mutex::new(Vec::new()),
            suspendable: false,
            instant_boot: true,
            fail_creates: false,
        }
    }

    /// Drivers boot into `Creating` and need an explicit
    /// [`MockDriver::set_status`] to progress.
    pub fn slow_boot(mut self) -> Self {
        self.instant_boot = false;
        self
    }

    pub fn suspendable(mut self) -> Self {
        self.suspendable = true;
        self
    }

    /// Every `create` fails, as if the backend is out of disk.
    pub fn failing() -> Self {
        Self {
            fail_creates: true,
            ..Self::new()
        }
    }

    pub fn with_on_disk(self, instances: Vec<OnDiskVm>) -> Self {
        *self
            .on_disk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = instances;
        self
    }

    pub fn journal(&self) -> CallJournal {
        Arc::clone(&self.journal)
    }

    pub fn calls(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn driver(&self, name: &str) -> Option<Arc<MockDriver>> {
        self.drivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

impl Default for MockDriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn create(&self, vm: &Vm) -> Result<Arc<dyn VmDriver>, DriverError> {
        record(&self.journal, format!("create {}", vm.name));
        if self.fail_creates {
            return Err(DriverError::Failed("mock factory configured to fail".into()));
        }

        debug!(vm = %vm.name, "Creating mock driver");
        let driver = Arc::new(MockDriver {
            name: vm.name.clone(),
            journal: Arc::clone(&self.journal),
            state: Mutex::new(MockDriverState::default()),
            suspendable: self.suspendable,
            instant_boot: self.instant_boot,
        });
        self.drivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(vm.name.clone(), Arc::clone(&driver));
        Ok(driver)
    }

    async fn list_on_disk(&self) -> Result<Vec<OnDiskVm>, DriverError> {
        Ok(self
            .on_disk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn stop_on_disk(&self, name: &str) -> Result<(), DriverError> {
        record(&self.journal, format!("stop-on-disk {name}"));
        Ok(())
    }

    async fn destroy_on_disk(&self, name: &str) -> Result<(), DriverError> {
        record(&self.journal, format!("destroy-on-disk {name}"));
        Ok(())
    }
}
