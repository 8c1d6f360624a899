//! In-memory transactional store for vmfleet resource records.
//!
//! Stands in for the controller's durable store while honoring the
//! contract the scheduler and API layer rely on:
//!
//! - `view`/`update` closure transactions; `update` commits on `Ok` and
//!   discards every write on `Err`.
//! - Every write assigns the next monotonically increasing version,
//!   used for optimistic concurrency and change-watch ordering.
//! - `get_*` on a missing key returns [`StoreError::NotFound`]; `set_*`
//!   is an upsert.
//! - A small number of transaction conflicts is retried transparently
//!   before surfacing [`StoreError::Conflict`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::debug;
use vmfleet_model::{ClusterSettings, Vm, Worker};

/// How many times `update` re-runs a closure that hit a version conflict.
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Default)]
struct Inner {
    vms: BTreeMap<String, Vm>,
    workers: BTreeMap<String, Worker>,
    settings: ClusterSettings,
    next_version: u64,
}

impl Inner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// The in-memory store. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<Inner>,
    committed: watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (committed, _) = watch::channel(0);
        Store {
            inner: RwLock::new(Inner::default()),
            committed,
        }
    }

    fn snapshot(&self) -> Result<Txn, StoreError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StoreError::Internal("store lock poisoned".into()))?;
        Ok(Txn {
            base_version: guard.next_version,
            inner: guard.clone(),
        })
    }

    /// Run a read-only transaction over a consistent snapshot.
    pub fn view<R>(&self, f: impl FnOnce(&Txn) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let txn = self.snapshot()?;
        f(&txn)
    }

    /// Run a read-write transaction.
    ///
    /// The closure operates on a copy of the store; on `Ok` the copy is
    /// committed atomically, on `Err` it is discarded. Conflicts re-run
    /// the closure from a fresh snapshot a bounded number of times.
    pub fn update<R>(
        &self,
        mut f: impl FnMut(&mut Txn) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut attempt = 0;
        loop {
            let mut txn = self.snapshot()?;
            match f(&mut txn) {
                Ok(result) => {
                    let mut guard = self
                        .inner
                        .write()
                        .map_err(|_| StoreError::Internal("store lock poisoned".into()))?;

                    // Another writer slipped in between snapshot and
                    // commit; re-run against the new state.
                    if guard.next_version != txn.base_version {
                        attempt += 1;
                        if attempt > MAX_CONFLICT_RETRIES {
                            return Err(StoreError::Conflict(
                                "transaction retries exhausted".into(),
                            ));
                        }
                        debug!(attempt, "store transaction raced, retrying");
                        continue;
                    }

                    let version = txn.inner.next_version;
                    *guard = txn.inner;
                    drop(guard);
                    let _ = self.committed.send(version);
                    return Ok(result);
                }
                Err(StoreError::Conflict(reason)) => {
                    attempt += 1;
                    if attempt > MAX_CONFLICT_RETRIES {
                        return Err(StoreError::Conflict(reason));
                    }
                    debug!(attempt, %reason, "store transaction conflict, retrying");
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Watch the last committed version (change notification for
    /// long-poll watchers).
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.committed.subscribe()
    }
}

/// A transaction over a snapshot of the store.
///
/// Obtained through [`Store::view`] (shared reference, reads only) or
/// [`Store::update`] (exclusive reference, writes allowed).
pub struct Txn {
    inner: Inner,
    base_version: u64,
}

impl Txn {
    pub fn list_vms(&self) -> Result<Vec<Vm>, StoreError> {
        Ok(self.inner.vms.values().cloned().collect())
    }

    pub fn get_vm(&self, name: &str) -> Result<Vm, StoreError> {
        self.inner.vms.get(name).cloned().ok_or(StoreError::NotFound)
    }

    pub fn set_vm(&mut self, mut vm: Vm) -> Result<Vm, StoreError> {
        if let Some(existing) = self.inner.vms.get(&vm.name) {
            if existing.version != vm.version {
                return Err(StoreError::Conflict(format!(
                    "vm {:?} was modified concurrently",
                    vm.name
                )));
            }
        }
        vm.version = self.inner.bump_version();
        self.inner.vms.insert(vm.name.clone(), vm.clone());
        Ok(vm)
    }

    pub fn delete_vm(&mut self, name: &str) -> Result<(), StoreError> {
        match self.inner.vms.remove(name) {
            Some(_) => {
                self.inner.bump_version();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.inner.workers.values().cloned().collect())
    }

    pub fn get_worker(&self, name: &str) -> Result<Worker, StoreError> {
        self.inner
            .workers
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn set_worker(&mut self, mut worker: Worker) -> Result<Worker, StoreError> {
        if let Some(existing) = self.inner.workers.get(&worker.name) {
            if existing.version != worker.version {
                return Err(StoreError::Conflict(format!(
                    "worker {:?} was modified concurrently",
                    worker.name
                )));
            }
        }
        worker.version = self.inner.bump_version();
        self.inner
            .workers
            .insert(worker.name.clone(), worker.clone());
        Ok(worker)
    }

    pub fn delete_worker(&mut self, name: &str) -> Result<(), StoreError> {
        match self.inner.workers.remove(name) {
            Some(_) => {
                self.inner.bump_version();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_cluster_settings(&self) -> Result<ClusterSettings, StoreError> {
        Ok(self.inner.settings.clone())
    }

    pub fn set_cluster_settings(&mut self, settings: ClusterSettings) -> Result<(), StoreError> {
        self.inner.settings = settings;
        self.inner.bump_version();
        Ok(())
    }
}
