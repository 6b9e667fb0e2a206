//! Process lifecycle
//!
//! Wires the mapping store, external sync, reverse proxy and management API
//! into one process sharing a single cancellation token.
//!
//! Startup order:
//!
//! 1. Load Kubernetes credentials and build the forwarding transport (fatal)
//! 2. Start the external sync loop
//! 3. Wait for the overlay interface, unless both listeners are pinned
//! 4. Bind both listeners (fatal)
//! 5. Serve until cancelled, then drain each server for up to 10 seconds

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::Settings;
use crate::credentials::{ClusterCredentials, CredentialSource, FileTokenReader};
use crate::error::Result;
use crate::interface::InterfaceLocator;
use crate::mappings::UserMappingStore;
use crate::netclient::NetclientProbe;
use crate::proxy::{self, ProxyState};
use crate::server::{bind, bind_address, serve_until_cancelled, SHUTDOWN_GRACE};
use crate::sync::MappingSync;
use crate::upstream::ReqwestUpstream;

/// Run the bridge until `cancel` fires or a server fails
pub async fn run(settings: Settings, source: CredentialSource, cancel: CancellationToken) -> Result<()> {
    info!(
        mode = %settings.proxy.mode,
        impersonate_user = %settings.proxy.impersonate_user,
        impersonate_groups = ?settings.proxy.impersonate_groups,
        skip_tls_verify = settings.transport.skip_tls_verify,
        "Starting Netmaker Kubernetes proxy"
    );
    if settings.transport.skip_tls_verify {
        warn!("TLS verification of the API server is disabled");
    }

    let credentials = ClusterCredentials::load(&source).await?;
    let upstream = ReqwestUpstream::new(&credentials, &settings.transport)?;

    let store = Arc::new(UserMappingStore::new());
    let sync = Arc::new(MappingSync::new(settings.sync.clone(), Arc::clone(&store)));

    let sync_task = tokio::spawn({
        let sync = Arc::clone(&sync);
        let cancel = cancel.clone();
        async move { sync.run_periodic(cancel).await }
    });

    let overlay = overlay_address(&settings, &cancel).await;
    if cancel.is_cancelled() {
        info!("Shutdown requested before listeners were bound");
        join_sync(sync_task).await;
        return Ok(());
    }

    let proxy_addr = bind_address(settings.listen.proxy_bind_ip, overlay, settings.listen.proxy_port);
    let api_addr = bind_address(settings.listen.api_bind_ip, overlay, settings.listen.api_port);
    let proxy_listener = bind(proxy_addr).await?;
    let api_listener = bind(api_addr).await?;

    let proxy_router = proxy::router(ProxyState {
        config: Arc::new(settings.proxy),
        store: Arc::clone(&store),
        credentials: Arc::new(credentials),
        upstream: Arc::new(upstream),
        tokens: Arc::new(FileTokenReader),
    });
    let api_router = api::router(ApiState {
        store,
        sync,
        netclient: Arc::new(NetclientProbe::default()),
    });

    let (proxy_result, api_result) = tokio::join!(
        cancel_on_error(
            serve_until_cancelled(proxy_listener, proxy_router, cancel.clone(), SHUTDOWN_GRACE, "proxy"),
            &cancel,
        ),
        cancel_on_error(
            serve_until_cancelled(api_listener, api_router, cancel.clone(), SHUTDOWN_GRACE, "api"),
            &cancel,
        ),
    );

    join_sync(sync_task).await;

    proxy_result.and(api_result)?;
    info!("Shutdown complete");
    Ok(())
}

/// Overlay address to bind to, if discovery is needed and succeeds
async fn overlay_address(settings: &Settings, cancel: &CancellationToken) -> Option<Ipv4Addr> {
    if settings.listen.fully_pinned() {
        return None;
    }

    let locator = InterfaceLocator::new(settings.interface.backoff.clone());
    let found = locator.locate(&settings.interface.name, cancel).await;
    if found.is_none() && !cancel.is_cancelled() {
        warn!(
            interface = %settings.interface.name,
            "Overlay interface not found, binding to all interfaces"
        );
    }
    found
}

async fn join_sync(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(error = %e, "External sync task panicked");
    }
}

/// Stop every sibling task when one server fails
async fn cancel_on_error<F>(task: F, cancel: &CancellationToken) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = task.await;
    if let Err(e) = &result {
        error!(error = %e, "Server failed, shutting down");
        cancel.cancel();
    }
    result
}
