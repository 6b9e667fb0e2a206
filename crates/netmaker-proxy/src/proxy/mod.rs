//! Reverse proxy core
//!
//! Forwards the Kubernetes API surface (`/api`, `/apis`, `/version`,
//! `/metrics`) to the API server after [`crate::auth::authenticate`] has
//! applied impersonation and upstream credentials.
//!
//! Layer order, outermost first:
//!
//! ```text
//! log_request ──► preflight (OPTIONS) ──► authenticate ──► forward
//! ```
//!
//! Upgrade requests (`kubectl exec`, `attach`, `port-forward`) keep their
//! `Upgrade` header. On a 101 from the API server the two connections are
//! bridged byte for byte without parsing the upgraded protocol.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tracing::{debug, error, info};

use crate::auth::{self, ClientIp};
use crate::config::ProxyConfig;
use crate::credentials::{ClusterCredentials, TokenReader};
use crate::error::{error_chain, Error};
use crate::mappings::UserMappingStore;
use crate::upstream::{UpgradeOutcome, UpgradedIo, UpstreamClient, UpstreamRequest, UpstreamResponse};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size (10 MB, ample for Kubernetes objects)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Status used when the caller hung up before a response could be written
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Transport error fragments that mean the caller went away.
///
/// hyper's "operation was canceled" is not listed: it is what reqwest
/// reports when the API server drops the connection.
const CLIENT_DISCONNECT_MARKERS: &[&str] = &["client disconnected", "request canceled"];

const CORS_ALLOW_ORIGIN: &str = "*";
const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization";

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// ============================================================================
// State and router
// ============================================================================

/// Shared state of the reverse proxy
#[derive(Clone)]
pub struct ProxyState {
    /// Authentication behavior
    pub config: Arc<ProxyConfig>,
    /// IP to identity mappings
    pub store: Arc<UserMappingStore>,
    /// API server location and the proxy's own credential
    pub credentials: Arc<ClusterCredentials>,
    /// Forwarding transport
    pub upstream: Arc<dyn UpstreamClient>,
    /// Token file reader for rotating service-account tokens
    pub tokens: Arc<dyn TokenReader>,
}

/// Build the reverse proxy router
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/api", any(forward))
        .route("/api/{*path}", any(forward))
        .route("/apis", any(forward))
        .route("/apis/{*path}", any(forward))
        .route("/version", any(forward))
        .route("/metrics", any(forward))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::authenticate))
        .route_layer(middleware::from_fn(preflight))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

// ============================================================================
// Middleware
// ============================================================================

/// Answer CORS preflight requests without authenticating or forwarding
async fn preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        insert_cors_headers(response.headers_mut());
        return response;
    }
    next.run(request).await
}

/// Access log for every request on a server
pub(crate) async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_canonical().to_string())
        .unwrap_or_default();

    let response = next.run(request).await;
    info!(
        method = %method,
        path = %path,
        client_ip = %client,
        status = response.status().as_u16(),
        "Request"
    );
    response
}

// ============================================================================
// Forwarding
// ============================================================================

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    if is_upgrade_request(request.headers()) {
        return forward_upgrade(state, request).await;
    }

    let client_ip = request.extensions().get::<ClientIp>().copied();
    let (parts, body) = request.into_parts();

    let url = upstream_url(
        &state.credentials.api_server,
        parts.uri.path(),
        parts.uri.query(),
    );
    let headers = upstream_headers(parts.headers, client_ip);

    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            let error = Error::Proxy(format!("failed to read request body: {}", error_chain(&e)));
            return forward_error_response(error).unwrap_or_else(client_closed_response);
        }
    };

    debug!(method = %parts.method, url = %url, "Forwarding to API server");

    let result = state
        .upstream
        .send(UpstreamRequest {
            method: parts.method,
            url,
            headers,
            body,
        })
        .await;

    match result {
        Ok(upstream) => streamed_response(upstream),
        Err(e) => forward_error_response(e).unwrap_or_else(client_closed_response),
    }
}

async fn forward_upgrade(state: ProxyState, mut request: Request) -> Response {
    let client_ip = request.extensions().get::<ClientIp>().copied();
    let incoming = hyper::upgrade::on(&mut request);
    let (parts, _) = request.into_parts();

    let url = upstream_url(
        &state.credentials.api_server,
        parts.uri.path(),
        parts.uri.query(),
    );
    let protocol = parts.headers.get(UPGRADE).cloned();
    let mut headers = upstream_headers(parts.headers, client_ip);
    if let Some(protocol) = protocol {
        headers.insert(UPGRADE, protocol);
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    }

    debug!(method = %parts.method, url = %url, "Forwarding upgrade to API server");

    let result = state
        .upstream
        .upgrade(UpstreamRequest {
            method: parts.method,
            url,
            headers,
            body: Bytes::new(),
        })
        .await;

    match result {
        Ok(UpgradeOutcome::Switched { mut headers, io }) => {
            tokio::spawn(bridge(incoming, io));
            insert_cors_headers(&mut headers);

            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
            *response.headers_mut() = headers;
            response
        }
        Ok(UpgradeOutcome::Refused(upstream)) => streamed_response(upstream),
        Err(e) => forward_error_response(e).unwrap_or_else(client_closed_response),
    }
}

/// Copy bytes both ways until either side closes
async fn bridge(incoming: hyper::upgrade::OnUpgrade, mut upstream: Box<dyn UpgradedIo>) {
    let upgraded = match incoming.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!(error = %e, "Failed to upgrade client connection");
            return;
        }
    };

    let mut client = hyper_util::rt::TokioIo::new(upgraded);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_server)) => {
            debug!(from_client, from_server, "Upgraded session ended");
        }
        Err(e) => debug!(error = %e, "Upgraded session closed"),
    }
}

/// Whether the caller asked to switch protocols
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Request headers as sent upstream: hop-by-hop and framing headers
/// removed, caller appended to `X-Forwarded-For`
fn upstream_headers(mut headers: HeaderMap, client_ip: Option<ClientIp>) -> HeaderMap {
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    if let Some(ClientIp(ip)) = client_ip {
        append_forwarded_for(&mut headers, &ip.to_string());
    }
    headers
}

fn streamed_response(upstream: UpstreamResponse) -> Response {
    let mut headers = upstream.headers;
    strip_hop_by_hop(&mut headers);
    insert_cors_headers(&mut headers);

    let mut response = Response::new(upstream.body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}

/// Response for a failed forward, or `None` when the caller disconnected.
///
/// Disconnects are not logged.
pub fn forward_error_response(error: Error) -> Option<Response> {
    if is_client_disconnect(&error) {
        return None;
    }
    error!(error = %error, "Failed to proxy request to API server");
    Some(error.into_response())
}

/// Whether `error` only reports that the caller went away
pub fn is_client_disconnect(error: &Error) -> bool {
    let message = error.to_string();
    CLIENT_DISCONNECT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

fn client_closed_response() -> Response {
    let mut response = Response::new(Body::empty());
    if let Ok(status) = StatusCode::from_u16(CLIENT_CLOSED_REQUEST) {
        *response.status_mut() = status;
    }
    response
}

/// Join the API server base URL with the request path and query
pub fn upstream_url(base: &reqwest::Url, path: &str, query: Option<&str>) -> reqwest::Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    url
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS.iter().copied()) {
        headers.remove(name);
    }
}

/// Append `client_ip` to `X-Forwarded-For`
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

fn insert_cors_headers(headers: &mut HeaderMap) {
    use axum::http::header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    };
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(CORS_ALLOW_ORIGIN),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
}
