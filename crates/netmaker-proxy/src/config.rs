//! Startup configuration
//!
//! Every environment variable the proxy recognizes is read here, once, into
//! immutable structs that are handed to each component.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use netmaker_common::env::{first_non_empty, non_empty, parse_or, split_list};
use netmaker_common::{EnvSource, LinearBackoff, DEFAULT_INTERFACE_NAME};
use tracing::warn;

use crate::error::{Error, Result};
use crate::{DEFAULT_API_PORT, DEFAULT_PROXY_PORT};

/// Default identity for callers without a mapping
pub const DEFAULT_IMPERSONATE_USER: &str = "wireguard-peer";

/// Default groups for callers without a mapping
pub const DEFAULT_IMPERSONATE_GROUPS: &[&str] = &["system:authenticated", "wireguard-peers"];

/// Default interval between external mapping syncs
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// How the proxy presents callers to the Kubernetes API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// Callers are impersonated using their mapped or default identity
    Auth,
    /// Requests pass through without impersonation headers
    NoAuth,
    /// A mode this build does not understand; every proxied request fails
    Unrecognized(String),
}

impl ProxyMode {
    /// Parse a mode name, case-insensitively
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auth" => ProxyMode::Auth,
            "noauth" => ProxyMode::NoAuth,
            _ => ProxyMode::Unrecognized(value.to_string()),
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Auth => f.write_str("auth"),
            ProxyMode::NoAuth => f.write_str("noauth"),
            ProxyMode::Unrecognized(other) => f.write_str(other),
        }
    }
}

/// Authentication behavior of the reverse proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Authentication mode
    pub mode: ProxyMode,
    /// User impersonated when the caller IP has no mapping
    pub impersonate_user: String,
    /// Groups impersonated when the caller IP has no mapping
    pub impersonate_groups: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Auth,
            impersonate_user: DEFAULT_IMPERSONATE_USER.to_string(),
            impersonate_groups: DEFAULT_IMPERSONATE_GROUPS
                .iter()
                .map(|g| g.to_string())
                .collect(),
        }
    }
}

impl ProxyConfig {
    /// Read `PROXY_MODE`, `PROXY_IMPERSONATE_USER` and `PROXY_IMPERSONATE_GROUPS`.
    ///
    /// An unrecognized mode falls back to `auth`.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let defaults = Self::default();

        let mode = match non_empty(env, "PROXY_MODE").map(|m| ProxyMode::parse(&m)) {
            None => ProxyMode::Auth,
            Some(ProxyMode::Unrecognized(value)) => {
                warn!(mode = %value, "Unrecognized PROXY_MODE, defaulting to auth");
                ProxyMode::Auth
            }
            Some(mode) => mode,
        };

        Self {
            mode,
            impersonate_user: non_empty(env, "PROXY_IMPERSONATE_USER")
                .unwrap_or(defaults.impersonate_user),
            impersonate_groups: non_empty(env, "PROXY_IMPERSONATE_GROUPS")
                .map(|g| split_list(&g))
                .unwrap_or(defaults.impersonate_groups),
        }
    }
}

/// Connection settings for the external mapping source
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalSyncConfig {
    /// Host (and optional port) of the Netmaker server
    pub server_domain: String,
    /// Bearer token for the Netmaker API
    pub api_token: String,
    /// Interval between periodic syncs
    pub sync_interval: Duration,
}

impl fmt::Debug for ExternalSyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSyncConfig")
            .field("server_domain", &self.server_domain)
            .field("api_token", &"[REDACTED]")
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

impl Default for ExternalSyncConfig {
    fn default() -> Self {
        Self {
            server_domain: String::new(),
            api_token: String::new(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl ExternalSyncConfig {
    /// Read the `EXTERNAL_API_*` variables, falling back to their `API_*` aliases
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let interval_secs = first_non_empty(
            env,
            &["EXTERNAL_API_SYNC_INTERVAL", "API_SYNC_INTERVAL"],
        )
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0);

        Self {
            server_domain: first_non_empty(env, &["EXTERNAL_API_SERVER_DOMAIN", "API_SERVER_DOMAIN"])
                .unwrap_or_default(),
            api_token: first_non_empty(env, &["EXTERNAL_API_TOKEN", "API_TOKEN"])
                .unwrap_or_default(),
            sync_interval: interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SYNC_INTERVAL),
        }
    }

    /// Sync only runs when both the domain and the token are set
    pub fn is_configured(&self) -> bool {
        !self.server_domain.is_empty() && !self.api_token.is_empty()
    }
}

/// Overlay interface discovery settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Name of the interface created by the Netmaker agent
    pub name: String,
    /// Retry policy while waiting for the interface
    pub backoff: LinearBackoff,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_INTERFACE_NAME.to_string(),
            backoff: LinearBackoff::default(),
        }
    }
}

impl InterfaceConfig {
    /// Read `IFACE_NAME` and the `WIREGUARD_RETRY_*` variables
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let defaults = LinearBackoff::default();
        Self {
            name: non_empty(env, "IFACE_NAME").unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string()),
            backoff: LinearBackoff {
                max_attempts: parse_or(env, "WIREGUARD_RETRY_MAX_ATTEMPTS", defaults.max_attempts),
                base_delay: Duration::from_secs(parse_or(
                    env,
                    "WIREGUARD_RETRY_BASE_DELAY_SECONDS",
                    defaults.base_delay.as_secs(),
                )),
                max_delay: Duration::from_secs(parse_or(
                    env,
                    "WIREGUARD_RETRY_MAX_DELAY_SECONDS",
                    defaults.max_delay.as_secs(),
                )),
            },
        }
    }
}

/// Listener settings for both HTTP servers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenConfig {
    /// Reverse proxy port
    pub proxy_port: u16,
    /// Explicit reverse proxy bind address
    pub proxy_bind_ip: Option<IpAddr>,
    /// Management API port
    pub api_port: u16,
    /// Explicit management API bind address
    pub api_bind_ip: Option<IpAddr>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            proxy_bind_ip: None,
            api_port: DEFAULT_API_PORT,
            api_bind_ip: None,
        }
    }
}

impl ListenConfig {
    /// Read `PROXY_PORT`, `PROXY_BIND_IP`, `API_PORT` and `API_BIND_IP`.
    ///
    /// A bind IP that does not parse is a startup error; the process cannot
    /// listen where it was told to.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        Ok(Self {
            proxy_port: parse_or(env, "PROXY_PORT", DEFAULT_PROXY_PORT),
            proxy_bind_ip: parse_bind_ip(env, "PROXY_BIND_IP")?,
            api_port: parse_or(env, "API_PORT", DEFAULT_API_PORT),
            api_bind_ip: parse_bind_ip(env, "API_BIND_IP")?,
        })
    }

    /// Whether both listeners have explicit addresses, making interface discovery unnecessary
    pub fn fully_pinned(&self) -> bool {
        self.proxy_bind_ip.is_some() && self.api_bind_ip.is_some()
    }
}

fn parse_bind_ip(env: &dyn EnvSource, key: &str) -> Result<Option<IpAddr>> {
    non_empty(env, key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={value} is not an IP address: {e}")))
        })
        .transpose()
}

/// Upstream TLS settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Skip verification of the API server certificate
    pub skip_tls_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            skip_tls_verify: true,
        }
    }
}

impl TransportConfig {
    /// Read `PROXY_SKIP_TLS_VERIFY`; only the literal `false` enables verification
    pub fn from_env(env: &dyn EnvSource) -> Self {
        Self {
            skip_tls_verify: env.var("PROXY_SKIP_TLS_VERIFY").as_deref() != Some("false"),
        }
    }
}

/// Everything read from the environment at startup
#[derive(Clone, Debug)]
pub struct Settings {
    /// Reverse proxy authentication behavior
    pub proxy: ProxyConfig,
    /// External mapping sync
    pub sync: ExternalSyncConfig,
    /// Overlay interface discovery
    pub interface: InterfaceConfig,
    /// HTTP listeners
    pub listen: ListenConfig,
    /// Upstream TLS
    pub transport: TransportConfig,
    /// Kubeconfig used outside the cluster
    pub kubeconfig: Option<PathBuf>,
}

impl Settings {
    /// Load all settings from `env`
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        Ok(Self {
            proxy: ProxyConfig::from_env(env),
            sync: ExternalSyncConfig::from_env(env),
            interface: InterfaceConfig::from_env(env),
            listen: ListenConfig::from_env(env)?,
            transport: TransportConfig::from_env(env),
            kubeconfig: kubeconfig_path(env),
        })
    }
}

/// `KUBECONFIG`, else `$HOME/.kube/config`
fn kubeconfig_path(env: &dyn EnvSource) -> Option<PathBuf> {
    non_empty(env, "KUBECONFIG")
        .map(PathBuf::from)
        .or_else(|| non_empty(env, "HOME").map(|home| PathBuf::from(home).join(".kube/config")))
}
