//! Process-wide shutdown signal

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Create a `CancellationToken` that is cancelled on SIGINT or SIGTERM.
///
/// Callers hand clones of the token to every long-running task.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });

    token
}

/// Wait for the first of SIGINT or SIGTERM.
///
/// A signal that cannot be installed is logged and never fires.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
