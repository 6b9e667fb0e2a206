//! Per-request authentication
//!
//! Two independent steps run before every forwarded request:
//!
//! 1. Impersonation: in `auth` mode the caller's overlay IP is resolved to a
//!    Kubernetes identity (mapped, or the configured default) and presented
//!    to the API server through `Impersonate-*` headers.
//! 2. Upstream credentials: the proxy authenticates itself to the API server
//!    with its own token, certificate or basic credential.
//!
//! # Security
//!
//! In `auth` mode, caller-supplied impersonation headers are always stripped
//! before the proxy sets its own, so a caller cannot widen its identity.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use tracing::debug;

use crate::config::{ProxyConfig, ProxyMode};
use crate::credentials::{TokenReader, UpstreamAuth};
use crate::error::{Error, Result};
use crate::mappings::UserMappingStore;
use crate::proxy::ProxyState;

/// User to impersonate
pub const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");

/// Groups to impersonate, comma joined
pub const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");

/// Audit header carrying the caller's overlay IP
pub const ORIGINAL_USER_HEADER: HeaderName =
    HeaderName::from_static("impersonate-extra-original-user");

/// Audit header carrying the fixed overlay group tag
pub const ORIGINAL_GROUP_HEADER: HeaderName =
    HeaderName::from_static("impersonate-extra-original-group");

/// Group tag recorded in [`ORIGINAL_GROUP_HEADER`]
pub const OVERLAY_GROUP_TAG: &str = "wireguard-peers";

/// User-Agent sent on every forwarded request
pub const UPSTREAM_USER_AGENT: &str = "netmaker-k8s-proxy/1.0";

/// Prefix shared by every Kubernetes impersonation header
const IMPERSONATE_PREFIX: &str = "impersonate-";

/// Caller address, canonicalized, stored in request extensions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Identity chosen for a caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// User to impersonate
    pub user: String,
    /// Groups to impersonate
    pub groups: Vec<String>,
    /// Whether the identity came from the mapping store
    pub mapped: bool,
}

/// Mapped identity for `client_ip`, else the configured default
pub fn resolve_identity(
    config: &ProxyConfig,
    store: &UserMappingStore,
    client_ip: &str,
) -> ResolvedIdentity {
    match store.get(client_ip) {
        Some(mapping) => ResolvedIdentity {
            user: mapping.user,
            groups: mapping.groups,
            mapped: true,
        },
        None => ResolvedIdentity {
            user: config.impersonate_user.clone(),
            groups: config.impersonate_groups.clone(),
            mapped: false,
        },
    }
}

/// Remove every `Impersonate-*` header
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_PREFIX))
        .cloned()
        .collect();
    for name in names {
        headers.remove(&name);
    }
}

/// Apply the impersonation policy of `config.mode` to `headers`
pub fn apply_impersonation(
    config: &ProxyConfig,
    store: &UserMappingStore,
    client_ip: IpAddr,
    headers: &mut HeaderMap,
) -> Result<()> {
    match &config.mode {
        ProxyMode::NoAuth => {
            debug!(client_ip = %client_ip, "No-auth mode, forwarding without impersonation");
            Ok(())
        }
        ProxyMode::Unrecognized(mode) => Err(Error::InvalidProxyMode(mode.clone())),
        ProxyMode::Auth => {
            strip_impersonation_headers(headers);

            let ip = client_ip.to_string();
            let identity = resolve_identity(config, store, &ip);
            if identity.mapped {
                debug!(client_ip = %ip, user = %identity.user, groups = ?identity.groups, "Using mapped identity");
            } else {
                debug!(client_ip = %ip, user = %identity.user, groups = ?identity.groups, "No mapping for client IP, using default identity");
            }

            if !identity.user.is_empty() {
                headers.insert(IMPERSONATE_USER, header_value(&identity.user)?);
            }
            if !identity.groups.is_empty() {
                headers.insert(IMPERSONATE_GROUP, header_value(&identity.groups.join(","))?);
            }
            headers.insert(ORIGINAL_USER_HEADER, header_value(&ip)?);
            headers.insert(ORIGINAL_GROUP_HEADER, HeaderValue::from_static(OVERLAY_GROUP_TAG));
            Ok(())
        }
    }
}

/// Attach the proxy's own credential to `headers`.
///
/// Without a configured credential the caller must have sent an
/// `Authorization` header, which is forwarded untouched.
pub async fn attach_upstream_credentials(
    headers: &mut HeaderMap,
    auth: &UpstreamAuth,
    tokens: &dyn TokenReader,
) -> Result<()> {
    match auth {
        UpstreamAuth::BearerToken(token) => {
            headers.insert(AUTHORIZATION, bearer(token)?);
        }
        UpstreamAuth::BearerTokenFile(path) => {
            let token = tokens.read_token(path).await?;
            headers.insert(AUTHORIZATION, bearer(&token)?);
        }
        UpstreamAuth::ClientCertificate { .. } => {
            debug!("Authenticating upstream with client certificate");
        }
        UpstreamAuth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{}", password.as_str()));
            let mut value = header_value(&format!("Basic {encoded}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        UpstreamAuth::None => {
            if !headers.contains_key(AUTHORIZATION) {
                return Err(Error::Unauthorized(
                    "no upstream credentials configured and no Authorization header".into(),
                ));
            }
        }
    }

    headers.insert(USER_AGENT, HeaderValue::from_static(UPSTREAM_USER_AGENT));
    Ok(())
}

/// Authentication middleware for proxied routes
pub async fn authenticate(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let client_ip = peer.ip().to_canonical();

    apply_impersonation(&state.config, &state.store, client_ip, request.headers_mut())?;
    attach_upstream_credentials(
        request.headers_mut(),
        &state.credentials.auth,
        state.tokens.as_ref(),
    )
    .await?;

    request.extensions_mut().insert(ClientIp(client_ip));
    Ok(next.run(request).await)
}

fn bearer(token: &str) -> Result<HeaderValue> {
    let mut value = header_value(&format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("value cannot be sent as a header: {e}")))
}
