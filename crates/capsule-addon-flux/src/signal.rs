//! Turns process signals into cancellation.
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Cancels `cancel` once `SIGTERM` or `SIGINT` (Ctrl-C) is received.
///
/// Every task holding a child of `cancel` can use it to shut down gracefully.
pub fn cancel_on_shutdown_signal(cancel: CancellationToken) -> Result<(), SignalError> {
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C, shutting down"),
            () = cancel.cancelled() => return,
        }
        cancel.cancel();
    });

    Ok(())
}
