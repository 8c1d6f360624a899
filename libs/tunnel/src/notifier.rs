//! Per-worker push channel for watch instructions.
//!
//! Each connected worker registers exactly one slot keyed by its name;
//! a later registration under the same name displaces the earlier one,
//! so a reconnecting worker never fights its own stale watch. Senders
//! block until the worker takes the message, bounded by the caller's
//! cancellation and a registration-wait deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long [`Notifier::notify`] keeps polling for a worker that has no
/// registered watch yet before giving up.
pub const DEFAULT_WORKER_WAIT: Duration = Duration::from_secs(30);

/// Interval between registration lookups while waiting for a worker.
const LOOKUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NotifyError {
    /// No watch registered for the worker within the wait deadline.
    #[error("worker {0:?} has no active watch")]
    NoWorker(String),

    /// The worker's watch ended before it took the message.
    #[error("worker watch ended before delivery")]
    WatchEnded,

    /// The caller's context ended first.
    #[error("notify cancelled")]
    Cancelled,
}

struct WorkerSlot<M> {
    id: u64,
    tx: mpsc::Sender<M>,
    token: CancellationToken,
}

struct NotifierInner<M> {
    workers: Mutex<HashMap<String, WorkerSlot<M>>>,
    next_id: AtomicU64,
    worker_wait: Duration,
}

fn lock<M>(inner: &NotifierInner<M>) -> MutexGuard<'_, HashMap<String, WorkerSlot<M>>> {
    inner
        .workers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes messages of type `M` to named workers.
///
/// Cloning is cheap and shares the registration table.
pub struct Notifier<M> {
    inner: Arc<NotifierInner<M>>,
}

impl<M> Clone for Notifier<M> {
    fn clone(&self) -> Self {
        Notifier {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + 'static> Default for Notifier<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> Notifier<M> {
    pub fn new() -> Self {
        Self::with_worker_wait(DEFAULT_WORKER_WAIT)
    }

    pub fn with_worker_wait(worker_wait: Duration) -> Self {
        Notifier {
            inner: Arc::new(NotifierInner {
                workers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                worker_wait,
            }),
        }
    }

    /// Register `worker`'s watch and return the receiving end plus a
    /// guard that tears the registration down on drop.
    ///
    /// A second registration under the same name displaces the first:
    /// its channel closes and in-flight sends to it fail with
    /// [`NotifyError::WatchEnded`].
    pub fn register(&self, caller: &CancellationToken, worker: &str) -> (mpsc::Receiver<M>, Registration<M>) {
        // Capacity 1 keeps the sender blocked until the worker's watch
        // loop actually picks the message up.
        let (tx, rx) = mpsc::channel(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = caller.child_token();

        let displaced = lock(&self.inner).insert(
            worker.to_owned(),
            WorkerSlot {
                id,
                tx,
                token: token.clone(),
            },
        );
        if let Some(old) = displaced {
            debug!(worker, "displacing previous watch registration");
            old.token.cancel();
        }

        let registration = Registration {
            inner: Arc::clone(&self.inner),
            worker: worker.to_owned(),
            id,
            token,
        };
        (rx, registration)
    }

    /// Deliver `message` to `worker`, blocking until its watch channel
    /// accepts it.
    ///
    /// Waits up to the configured worker-wait deadline for the worker to
    /// register at all, then blocks on the handoff until the worker
    /// accepts, its watch ends, or `caller` is cancelled.
    ///
    /// The channel buffers a single message, so a send can complete just
    /// before the watch loop takes it; a registration that ends inside
    /// that window drops the instruction. Delivery is at-most-once
    /// either way, and every instruction has a poll-based fallback.
    pub async fn notify(
        &self,
        caller: &CancellationToken,
        worker: &str,
        message: M,
    ) -> Result<(), NotifyError> {
        let deadline = tokio::time::Instant::now() + self.inner.worker_wait;

        let (tx, watch_token) = loop {
            if let Some(slot) = lock(&self.inner).get(worker) {
                break (slot.tx.clone(), slot.token.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NotifyError::NoWorker(worker.to_owned()));
            }
            tokio::select! {
                _ = tokio::time::sleep(LOOKUP_INTERVAL) => {}
                _ = caller.cancelled() => return Err(NotifyError::Cancelled),
            }
        };

        tokio::select! {
            sent = tx.send(message) => sent.map_err(|_| NotifyError::WatchEnded),
            _ = watch_token.cancelled() => Err(NotifyError::WatchEnded),
            _ = caller.cancelled() => Err(NotifyError::Cancelled),
        }
    }
}

/// Guard for a worker's watch registration.
///
/// Dropping it removes the registration, unless a newer watch for the
/// same worker already displaced it.
pub struct Registration<M> {
    inner: Arc<NotifierInner<M>>,
    worker: String,
    id: u64,
    token: CancellationToken,
}

impl<M> Drop for Registration<M> {
    fn drop(&mut self) {
        let mut workers = lock(&self.inner);
        if workers.get(&self.worker).is_some_and(|slot| slot.id == self.id) {
            workers.remove(&self.worker);
        }
        drop(workers);
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn notify_unregistered_worker_times_out() {
        let notifier = Notifier::<u32>::with_worker_wait(Duration::from_secs(3));
        let caller = CancellationToken::new();

        let err = notifier.notify(&caller, "w1", 1).await.unwrap_err();
        assert_eq!(err, NotifyError::NoWorker("w1".into()));
    }

    #[tokio::test]
    async fn notify_delivers_to_registered_worker() {
        let notifier = Notifier::<u32>::new();
        let caller = CancellationToken::new();

        let (mut rx, _registration) = notifier.register(&caller, "w1");
        notifier.notify(&caller, "w1", 7).await.unwrap();

        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_waits_for_late_registration() {
        let notifier = Notifier::<u32>::new();
        let caller = CancellationToken::new();

        let registering = notifier.clone();
        let register_caller = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let (mut rx, _registration) = registering.register(&register_caller, "w1");
            assert_eq!(rx.recv().await, Some(9));
        });

        notifier.notify(&caller, "w1", 9).await.unwrap();
    }

    #[tokio::test]
    async fn notify_blocks_until_receiver_takes_message() {
        let notifier = Notifier::<u32>::new();
        let caller = CancellationToken::new();

        let (mut rx, _registration) = notifier.register(&caller, "w1");
        // Fill the single-slot channel so the next send must block.
        notifier.notify(&caller, "w1", 1).await.unwrap();

        let blocked = {
            let notifier = notifier.clone();
            let caller = caller.clone();
            tokio::spawn(async move { notifier.notify(&caller, "w1", 2).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(1));
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_registration_fails_pending_notify() {
        let notifier = Notifier::<u32>::new();
        let caller = CancellationToken::new();

        let (_rx, registration) = notifier.register(&caller, "w1");
        notifier.notify(&caller, "w1", 1).await.unwrap();

        let blocked = {
            let notifier = notifier.clone();
            let caller = caller.clone();
            tokio::spawn(async move { notifier.notify(&caller, "w1", 2).await })
        };
        tokio::task::yield_now().await;
        drop(registration);

        assert_eq!(blocked.await.unwrap().unwrap_err(), NotifyError::WatchEnded);
    }

    #[tokio::test]
    async fn reregistration_displaces_previous_watch() {
        let notifier = Notifier::<u32>::new();
        let caller = CancellationToken::new();

        let (_old_rx, old_registration) = notifier.register(&caller, "w1");
        let (mut new_rx, _new_registration) = notifier.register(&caller, "w1");

        // The stale guard must not tear down the replacement watch.
        drop(old_registration);

        notifier.notify(&caller, "w1", 3).await.unwrap();
        assert_eq!(new_rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn cancelled_caller_aborts_notify() {
        let notifier = Notifier::<u32>::new();
        let registration_caller = CancellationToken::new();
        let (_rx, _registration) = notifier.register(&registration_caller, "w1");
        notifier.notify(&registration_caller, "w1", 1).await.unwrap();

        let caller = CancellationToken::new();
        let blocked = {
            let notifier = notifier.clone();
            let caller = caller.clone();
            tokio::spawn(async move { notifier.notify(&caller, "w1", 2).await })
        };
        tokio::task::yield_now().await;
        caller.cancel();

        assert_eq!(blocked.await.unwrap().unwrap_err(), NotifyError::Cancelled);
    }
}
