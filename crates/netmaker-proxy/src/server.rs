//! Listener setup and bounded graceful shutdown

use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Time allowed for in-flight requests after shutdown begins
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Explicit address, else the overlay address, else all interfaces
pub fn bind_address(explicit: Option<IpAddr>, overlay: Option<Ipv4Addr>, port: u16) -> SocketAddr {
    let ip = explicit
        .or(overlay.map(IpAddr::V4))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, port)
}

/// Bind a TCP listener on `addr`
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Serve `router` until `cancel` fires, then drain for at most `grace`.
///
/// Handlers see the peer address through `ConnectInfo<SocketAddr>`.
pub async fn serve_until_cancelled(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
    name: &'static str,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("listener has no local address: {e}")))?;
    info!(server = name, addr = %addr, "Server listening");

    let app = router.into_make_service_with_connect_info::<SocketAddr>();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .into_future();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            return result.map_err(|e| Error::Internal(format!("{name} server failed: {e}")));
        }
        _ = cancel.cancelled() => {}
    }

    info!(server = name, grace_secs = grace.as_secs(), "Shutting down server");
    match tokio::time::timeout(grace, serve).await {
        Ok(result) => {
            result.map_err(|e| Error::Internal(format!("{name} server failed: {e}")))?;
            info!(server = name, "Server stopped");
        }
        Err(_) => {
            warn!(server = name, "Graceful shutdown timed out, abandoning open connections");
        }
    }
    Ok(())
}
