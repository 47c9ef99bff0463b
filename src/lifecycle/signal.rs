//! Shutdown on Ctrl-C.

use std::future::Future;
use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancels `shutdown` once `signal` resolves. If the signal cannot be listened for,
/// the token is left alone and the process keeps running.
pub async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Unable to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
