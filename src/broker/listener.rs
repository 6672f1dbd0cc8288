//! TCP accept loop with temporary-error backoff.

use crate::broker::{connection, BrokerCore};
use crate::core::time::Clock;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Accept connections until shutdown. Temporary accept errors back off
/// exponentially from 5 ms to 1 s; a non-temporary error ends the loop.
pub(crate) async fn run_tcp<C: Clock>(core: Arc<BrokerCore<C>>, listener: TcpListener) {
    let mut backoff = None;
    loop {
        let accepted = tokio::select! {
            biased;
            () = core.closed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                backoff = None;
                tracing::debug!("accepted connection from {peer}");
                let core = core.clone();
                tokio::spawn(async move {
                    connection::serve_connection(core, stream).await;
                });
            }
            Err(err) if is_temporary(&err) => {
                let delay = backoff.map_or(BACKOFF_INITIAL, |d: Duration| {
                    (d * 2).min(BACKOFF_MAX)
                });
                backoff = Some(delay);
                tracing::warn!("temporary accept error, retrying in {delay:?}: {err}");
                core.clock.sleep(delay).await;
            }
            Err(err) => {
                tracing::error!("accept failed, stopping listener: {err}");
                break;
            }
        }
    }
}

/// Conditions a later accept can recover from: per-connection failures
/// that surfaced through accept, not listener-level faults.
fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}
