//! Interface Locator
//!
//! The Netmaker agent creates the overlay interface and assigns its address
//! asynchronously. The locator polls the host interfaces with linear backoff
//! until the named interface carries a usable IPv4 address.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use netmaker_common::{poll_with_backoff, LinearBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One address assigned to a host interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Interface name
    pub name: String,
    /// Assigned address
    pub addr: IpAddr,
}

/// Source of host interface addresses
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceEnumerator: Send + Sync {
    /// List every address on every interface
    fn addresses(&self) -> Result<Vec<InterfaceAddress>>;
}

/// Reads interface addresses from the host via `getifaddrs`
#[derive(Clone, Copy, Debug, Default)]
pub struct HostInterfaces;

impl InterfaceEnumerator for HostInterfaces {
    fn addresses(&self) -> Result<Vec<InterfaceAddress>> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| Error::Internal(format!("failed to enumerate interfaces: {e}")))?;

        Ok(addrs
            .filter_map(|ifaddr| {
                let storage = ifaddr.address?;
                let addr = if let Some(v4) = storage.as_sockaddr_in() {
                    IpAddr::V4(v4.ip())
                } else {
                    IpAddr::V6(storage.as_sockaddr_in6()?.ip())
                };
                Some(InterfaceAddress {
                    name: ifaddr.interface_name,
                    addr,
                })
            })
            .collect())
    }
}

/// First usable IPv4 address on interface `name`
pub fn usable_ipv4(addresses: &[InterfaceAddress], name: &str) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .filter(|a| a.name == name)
        .find_map(|a| match a.addr {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
}

/// Polls for the overlay interface address
#[derive(Clone)]
pub struct InterfaceLocator {
    enumerator: Arc<dyn InterfaceEnumerator>,
    backoff: LinearBackoff,
}

impl InterfaceLocator {
    /// Create a locator over the host interfaces
    pub fn new(backoff: LinearBackoff) -> Self {
        Self::with_enumerator(Arc::new(HostInterfaces), backoff)
    }

    /// Create a locator over a custom enumerator
    pub fn with_enumerator(enumerator: Arc<dyn InterfaceEnumerator>, backoff: LinearBackoff) -> Self {
        Self { enumerator, backoff }
    }

    /// Wait for interface `name` to carry an IPv4 address.
    ///
    /// Returns `None` once the retry budget is spent or `cancel` fires. An
    /// enumeration failure counts as a miss.
    pub async fn locate(&self, name: &str, cancel: &CancellationToken) -> Option<Ipv4Addr> {
        info!(
            interface = %name,
            max_attempts = self.backoff.max_attempts,
            "Waiting for overlay interface"
        );

        let outcome = poll_with_backoff(&self.backoff, "overlay interface discovery", cancel, |attempt| {
            let enumerator = Arc::clone(&self.enumerator);
            async move {
                match enumerator.addresses() {
                    Ok(addresses) => {
                        let found = usable_ipv4(&addresses, name);
                        if found.is_none() {
                            debug!(interface = %name, attempt, "Interface has no usable IPv4 address yet");
                        }
                        found
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "Interface enumeration failed");
                        None
                    }
                }
            }
        })
        .await;

        match outcome.ready() {
            Some(addr) => {
                info!(interface = %name, address = %addr, "Found overlay interface address");
                Some(addr)
            }
            None => None,
        }
    }
}
