//! Tunneling primitives for the vmfleet controller.
//!
//! Workers only ever hold outbound connections, so the controller brokers
//! byte streams through three building blocks:
//!
//! - [`Rendezvous`]: matches a waiting requester with a later-arriving
//!   responder via a random session token.
//! - [`Notifier`]: pushes an instruction down a specific worker's
//!   long-lived watch channel.
//! - [`proxy::connections`]: splices two duplex streams together.
//!
//! All three are purely in-memory and process-lifetime; in-flight
//! sessions simply fail on controller restart.

pub mod notifier;
pub mod proxy;
pub mod rendezvous;
mod session;

pub use notifier::{Notifier, NotifyError, Registration};
pub use rendezvous::{PendingRequest, Rendezvous, RendezvousError};
pub use session::new_session_token;
