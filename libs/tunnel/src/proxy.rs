//! Bidirectional byte-stream splicing.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Grace period for draining the opposite direction once one side of
/// the splice finishes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Splice two duplex streams together until either direction finishes.
///
/// As soon as one copy direction completes (EOF or error), both streams
/// are shut down so the peers observe the closure promptly; the
/// opposite direction gets a short drain window first. The first
/// direction's outcome decides the result, with disconnect-shaped
/// errors treated as a normal teardown.
pub async fn connections<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = Box::pin(tokio::io::copy(&mut a_read, &mut b_write));
    let mut b_to_a = Box::pin(tokio::io::copy(&mut b_read, &mut a_write));

    let first = tokio::select! {
        done = &mut a_to_b => {
            drop(a_to_b);
            trace!(?done, "forward direction finished first");
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut b_to_a).await;
            drop(b_to_a);
            let _ = b_write.shutdown().await;
            let _ = a_write.shutdown().await;
            done
        }
        done = &mut b_to_a => {
            drop(b_to_a);
            trace!(?done, "reverse direction finished first");
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut a_to_b).await;
            drop(a_to_b);
            let _ = a_write.shutdown().await;
            let _ = b_write.shutdown().await;
            done
        }
    };

    match first {
        Ok(_) => Ok(()),
        Err(err) if is_benign_close(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Errors that merely describe the other side hanging up.
fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
