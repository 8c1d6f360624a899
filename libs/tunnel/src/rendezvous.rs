//! Session-keyed request/response broker.
//!
//! A requester opens a single-use slot under an unguessable session
//! token and waits; a responder that learned the token out-of-band hands
//! over a typed result and receives back a cancellation token tied to
//! the requester's lifetime, so any derived resource (e.g. a proxied
//! connection) lives exactly as long as the requester cares.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RendezvousError {
    /// The session is unknown or already consumed. Callers treat this as
    /// a benign race: the requester gave up first.
    #[error("invalid rendezvous token")]
    InvalidToken,

    /// The requester's context ended before the handoff.
    #[error("rendezvous request cancelled")]
    Cancelled,
}

struct Slot<T> {
    tx: oneshot::Sender<T>,
    requester: CancellationToken,
}

type Sessions<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;

fn lock<T>(sessions: &Sessions<T>) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
    // The critical sections never panic; recover the map if one did.
    sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A session broker for results of type `T`.
///
/// Cloning is cheap and shares the session map.
pub struct Rendezvous<T> {
    sessions: Sessions<T>,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        Rendezvous {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Rendezvous {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a single-use result slot under `session`.
    ///
    /// The returned [`PendingRequest`] resolves once a responder calls
    /// [`Rendezvous::respond`] with the same token, or fails when
    /// `caller` is cancelled first. Dropping it destroys the session.
    pub fn request(&self, caller: &CancellationToken, session: impl Into<String>) -> PendingRequest<T> {
        let session = session.into();
        let (tx, rx) = oneshot::channel();
        let requester = caller.child_token();

        lock(&self.sessions).insert(
            session.clone(),
            Slot {
                tx,
                requester: requester.clone(),
            },
        );

        PendingRequest {
            session,
            rx,
            caller: caller.clone(),
            requester,
            sessions: Arc::clone(&self.sessions),
            completed: false,
        }
    }

    /// Hand `value` to the requester waiting on `session`.
    ///
    /// The session is consumed either way: a slot is matched exactly
    /// once and destroyed. On success the requester's cancellation token
    /// is returned so the responder can tie derived resources to it.
    pub fn respond(&self, session: &str, value: T) -> Result<CancellationToken, RendezvousError> {
        let slot = lock(&self.sessions)
            .remove(session)
            .ok_or(RendezvousError::InvalidToken)?;

        // The channel handoff happens after the lock is released.
        slot.tx
            .send(value)
            .map_err(|_| RendezvousError::InvalidToken)?;

        Ok(slot.requester)
    }
}

/// The requester's half of an open session.
pub struct PendingRequest<T> {
    session: String,
    rx: oneshot::Receiver<T>,
    caller: CancellationToken,
    requester: CancellationToken,
    sessions: Sessions<T>,
    completed: bool,
}

impl<T> PendingRequest<T> {
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Wait for the responder's value or the caller's cancellation.
    pub async fn wait(mut self) -> Result<T, RendezvousError> {
        let result = tokio::select! {
            received = &mut self.rx => received.map_err(|_| RendezvousError::Cancelled),
            _ = self.caller.cancelled() => Err(RendezvousError::Cancelled),
        };

        if result.is_ok() {
            self.completed = true;
        }

        result
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        lock(&self.sessions).remove(&self.session);

        // An abandoned request tears down whatever the responder derived
        // from it. A completed one stays tied to the caller's token.
        if !self.completed {
            self.requester.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn request_then_respond_delivers_value() {
        let rendezvous = Rendezvous::<u32>::new();
        let caller = CancellationToken::new();

        let pending = rendezvous.request(&caller, "s1");

        let responder = rendezvous.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            responder.respond("s1", 42).unwrap();
        });

        assert_eq!(pending.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn respond_before_wait_delivers_value() {
        let rendezvous = Rendezvous::<&'static str>::new();
        let caller = CancellationToken::new();

        let pending = rendezvous.request(&caller, "s1");
        rendezvous.respond("s1", "ready").unwrap();

        assert_eq!(pending.wait().await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn respond_without_request_is_invalid_token() {
        let rendezvous = Rendezvous::<u32>::new();
        assert_eq!(
            rendezvous.respond("unknown", 1).unwrap_err(),
            RendezvousError::InvalidToken
        );
    }

    #[tokio::test]
    async fn cancelled_requester_invalidates_session() {
        let rendezvous = Rendezvous::<u32>::new();
        let caller = CancellationToken::new();

        let pending = rendezvous.request(&caller, "s1");
        caller.cancel();

        assert_eq!(pending.wait().await.unwrap_err(), RendezvousError::Cancelled);
        assert_eq!(
            rendezvous.respond("s1", 42).unwrap_err(),
            RendezvousError::InvalidToken
        );
    }

    #[tokio::test]
    async fn responder_token_follows_requester_cancellation() {
        let rendezvous = Rendezvous::<u32>::new();
        let caller = CancellationToken::new();

        let pending = rendezvous.request(&caller, "s1");
        let responder_token = rendezvous.respond("s1", 7).unwrap();
        assert_eq!(pending.wait().await.unwrap(), 7);
        assert!(!responder_token.is_cancelled());

        caller.cancel();
        responder_token.cancelled().await;
    }

    #[tokio::test]
    async fn sessions_are_single_use() {
        let rendezvous = Rendezvous::<u32>::new();
        let caller = CancellationToken::new();

        let pending = rendezvous.request(&caller, "s1");
        rendezvous.respond("s1", 1).unwrap();
        assert_eq!(pending.wait().await.unwrap(), 1);

        assert_eq!(
            rendezvous.respond("s1", 2).unwrap_err(),
            RendezvousError::InvalidToken
        );
    }
}
