//! Tunnel broker: pairs API-side requests with worker-side callbacks.
//!
//! The controller never dials workers. To reach a VM, the API layer
//! opens a rendezvous session, pushes an instruction down the worker's
//! watch channel, and waits for the worker to call back with either a
//! byte stream (port-forward, exec) or a plain value (IP resolution).

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vmfleet_model::{
    ExecAction, PortForwardAction, ResolveIpAction, TerminalSize, WatchInstruction,
};
use vmfleet_tunnel::{new_session_token, Notifier, NotifyError, Rendezvous, RendezvousError};

/// Any duplex byte stream a worker can hand back.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type TunnelConn = Box<dyn Duplex>;

/// A worker's answer to a tunnel instruction.
///
/// Distinguishes "worker reachable but the operation failed" (an
/// `error_message`) from "worker unreachable" (no reply at all, surfaced
/// as a notify or rendezvous error instead).
#[derive(Debug, Default)]
pub struct WorkerReply<T> {
    pub value: Option<T>,
    pub error_message: Option<String>,
}

impl<T> WorkerReply<T> {
    pub fn ok(value: T) -> Self {
        WorkerReply {
            value: Some(value),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkerReply {
            value: None,
            error_message: Some(message.into()),
        }
    }

    fn into_result(self) -> Result<T, TunnelError> {
        match (self.value, self.error_message) {
            (Some(value), None) => Ok(value),
            (_, Some(message)) => Err(TunnelError::Worker(message)),
            (None, None) => Err(TunnelError::Worker("worker sent an empty reply".into())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    /// The worker answered, but the operation failed on its side.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Parameters for running a command inside a VM.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub terminal: Option<TerminalSize>,
}

/// Brokers tunnel sessions between the API layer and worker callbacks.
///
/// Cloning shares the underlying session maps.
#[derive(Clone)]
pub struct TunnelBroker {
    connections: Rendezvous<WorkerReply<TunnelConn>>,
    ips: Rendezvous<WorkerReply<String>>,
    notifier: Notifier<WatchInstruction>,
}

impl TunnelBroker {
    pub fn new(notifier: Notifier<WatchInstruction>) -> Self {
        TunnelBroker {
            connections: Rendezvous::new(),
            ips: Rendezvous::new(),
            notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier<WatchInstruction> {
        &self.notifier
    }

    /// Obtain a byte stream to `port` on the VM `vm_uid` hosted by
    /// `worker`.
    pub async fn port_forward(
        &self,
        caller: &CancellationToken,
        worker: &str,
        vm_uid: &str,
        port: u16,
    ) -> Result<TunnelConn, TunnelError> {
        let session = new_session_token();
        let pending = self.connections.request(caller, &session);

        self.notifier
            .notify(
                caller,
                worker,
                WatchInstruction::PortForward(PortForwardAction {
                    session,
                    vm_uid: vm_uid.to_owned(),
                    port,
                }),
            )
            .await?;

        pending.wait().await?.into_result()
    }

    /// Run a command inside the VM and obtain its I/O stream.
    pub async fn exec(
        &self,
        caller: &CancellationToken,
        worker: &str,
        vm_uid: &str,
        spec: ExecSpec,
    ) -> Result<TunnelConn, TunnelError> {
        let session = new_session_token();
        let pending = self.connections.request(caller, &session);

        self.notifier
            .notify(
                caller,
                worker,
                WatchInstruction::Exec(ExecAction {
                    session,
                    vm_uid: vm_uid.to_owned(),
                    command: spec.command,
                    args: spec.args,
                    interactive: spec.interactive,
                    tty: spec.tty,
                    terminal: spec.terminal,
                }),
            )
            .await?;

        pending.wait().await?.into_result()
    }

    /// Ask the hosting worker for the VM's IP address.
    pub async fn resolve_ip(
        &self,
        caller: &CancellationToken,
        worker: &str,
        vm_uid: &str,
    ) -> Result<String, TunnelError> {
        let session = new_session_token();
        let pending = self.ips.request(caller, &session);

        self.notifier
            .notify(
                caller,
                worker,
                WatchInstruction::ResolveIp(ResolveIpAction {
                    session,
                    vm_uid: vm_uid.to_owned(),
                }),
            )
            .await?;

        pending.wait().await?.into_result()
    }

    /// Worker callback carrying the byte stream (or failure) for a
    /// port-forward or exec session. Returns the requester's token so
    /// the caller can tie the spliced connection to it.
    pub fn respond_connection(
        &self,
        session: &str,
        reply: WorkerReply<TunnelConn>,
    ) -> Result<CancellationToken, RendezvousError> {
        match self.connections.respond(session, reply) {
            Ok(token) => Ok(token),
            Err(e) => {
                // The requester likely gave up; nothing to clean up.
                debug!(%session, "Connection callback for expired session");
                Err(e)
            }
        }
    }

    /// Worker callback carrying the resolved IP (or failure).
    pub fn respond_ip(
        &self,
        session: &str,
        reply: WorkerReply<String>,
    ) -> Result<CancellationToken, RendezvousError> {
        match self.ips.respond(session, reply) {
            Ok(token) => Ok(token),
            Err(e) => {
                debug!(%session, "IP callback for expired session");
                Err(e)
            }
        }
    }
}
