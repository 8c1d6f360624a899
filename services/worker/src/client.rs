//! Controller client interface and mock implementation.
//!
//! The worker talks to the controller through this seam: registration,
//! heartbeats, fetching its assigned VMs, and pushing status updates
//! back. The mock implementation runs against an in-process store so
//! the reconciliation engine can be exercised end-to-end without a
//! transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vmfleet_model::{Vm, Worker};
use vmfleet_store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("controller error: {0}")]
    Controller(String),
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ClientError::NotFound,
            other => ClientError::Controller(other.to_string()),
        }
    }
}

/// The worker's view of the controller.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Upsert this worker's record; returns the stored copy.
    async fn register_worker(&self, worker: Worker) -> Result<Worker, ClientError>;

    async fn get_worker(&self, name: &str) -> Result<Worker, ClientError>;

    async fn update_worker(&self, worker: Worker) -> Result<Worker, ClientError>;

    /// All VM records currently assigned to `worker`.
    async fn vms_for_worker(&self, worker: &str) -> Result<Vec<Vm>, ClientError>;

    async fn update_vm(&self, vm: Vm) -> Result<Vm, ClientError>;

    /// Answer a resolve-IP session, with either the address or an error
    /// message for the requester.
    async fn respond_ip(
        &self,
        session: &str,
        ip: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), ClientError>;
}

/// Recorded answer to a resolve-IP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpReply {
    pub session: String,
    pub ip: Option<String>,
    pub error_message: Option<String>,
}

/// Mock controller for testing and development, backed by an
/// in-process store.
pub struct MockController {
    store: Arc<Store>,
    ip_replies: Mutex<Vec<IpReply>>,
}

impl MockController {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            ip_replies: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ip_replies(&self) -> Vec<IpReply> {
        self.ip_replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ControllerClient for MockController {
    async fn register_worker(&self, mut worker: Worker) -> Result<Worker, ClientError> {
        let stored = self.store.update(|txn| {
            // Registration is an upsert: adopt the stored version so a
            // restarted worker replaces its old record.
            if let Ok(existing) = txn.get_worker(&worker.name) {
                worker.version = existing.version;
            }
            txn.set_worker(worker.clone())
        })?;
        Ok(stored)
    }

    async fn get_worker(&self, name: &str) -> Result<Worker, ClientError> {
        Ok(self.store.view(|txn| txn.get_worker(name))?)
    }

    async fn update_worker(&self, worker: Worker) -> Result<Worker, ClientError> {
        Ok(self.store.update(|txn| txn.set_worker(worker.clone()))?)
    }

    async fn vms_for_worker(&self, worker: &str) -> Result<Vec<Vm>, ClientError> {
        Ok(self.store.view(|txn| {
            Ok(txn
                .list_vms()?
                .into_iter()
                .filter(|vm| vm.worker.as_deref() == Some(worker))
                .collect())
        })?)
    }

    async fn update_vm(&self, vm: Vm) -> Result<Vm, ClientError> {
        Ok(self.store.update(|txn| txn.set_vm(vm.clone()))?)
    }

    async fn respond_ip(
        &self,
        session: &str,
        ip: Option<String>,
        error_message: Option<String>,
    ) -> Result<(), ClientError> {
        self.ip_replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(IpReply {
                session: session.to_owned(),
                ip,
                error_message,
            });
        Ok(())
    }
}
