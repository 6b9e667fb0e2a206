//! Forwarding transport to the Kubernetes API server
//!
//! Requests are buffered (API request bodies are small); responses are
//! streamed back chunk by chunk so watch and log-follow responses reach the
//! caller as soon as the API server writes them.
//!
//! Upgrade requests (exec, attach, port-forward) go over a separate HTTP/1.1
//! client; once the API server answers 101 the raw connection is handed back.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::TransportConfig;
use crate::credentials::{ClusterCredentials, UpstreamAuth};
use crate::error::{error_chain, Error, Result};

/// TCP connect plus TLS handshake budget
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive probe interval
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// How long an idle pooled connection is kept
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Request forwarded to the API server
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute upstream URL
    pub url: reqwest::Url,
    /// Headers after impersonation and credential attachment
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// Response from the API server
#[derive(Debug)]
pub struct UpstreamResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers as received
    pub headers: HeaderMap,
    /// Streaming response body
    pub body: Body,
}

/// Byte stream left after the API server switched protocols
pub trait UpgradedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpgradedIo for T {}

/// Result of forwarding an upgrade request
pub enum UpgradeOutcome {
    /// The API server answered 101
    Switched {
        /// 101 response headers
        headers: HeaderMap,
        /// Upgraded connection to the API server
        io: Box<dyn UpgradedIo>,
    },
    /// The API server answered without switching protocols
    Refused(UpstreamResponse),
}

/// Sends requests to the API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send one request and return the response head with a streaming body
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;

    /// Send an upgrade request and hand back the switched connection
    async fn upgrade(&self, request: UpstreamRequest) -> Result<UpgradeOutcome>;
}

/// [`UpstreamClient`] backed by a pooled reqwest client
#[derive(Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
}

impl ReqwestUpstream {
    /// Build the transport for `credentials`.
    ///
    /// There is no overall request timeout; watch responses stay open
    /// indefinitely.
    pub fn new(credentials: &ClusterCredentials, transport: &TransportConfig) -> Result<Self> {
        let client = client_builder(credentials, transport)?
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| {
                Error::Config(format!("failed to build upstream client: {}", error_chain(&e)))
            })?;

        // Upgrades need HTTP/1.1 and never return to the pool
        let upgrade_client = client_builder(credentials, transport)?
            .http1_only()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| {
                Error::Config(format!("failed to build upgrade client: {}", error_chain(&e)))
            })?;

        Ok(Self {
            client,
            upgrade_client,
        })
    }
}

fn client_builder(
    credentials: &ClusterCredentials,
    transport: &TransportConfig,
) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .danger_accept_invalid_certs(transport.skip_tls_verify);

    if !transport.skip_tls_verify {
        for der in &credentials.root_certs {
            let cert = reqwest::Certificate::from_der(der)
                .map_err(|e| Error::Config(format!("invalid cluster CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    if let UpstreamAuth::ClientCertificate { identity_pem } = &credentials.auth {
        let identity = reqwest::Identity::from_pem(identity_pem)
            .map_err(|e| Error::Config(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    Ok(builder)
}

fn streamed(response: reqwest::Response) -> UpstreamResponse {
    let status = response.status();
    let headers = response.headers().clone();
    let stream = response.bytes_stream().map_err(std::io::Error::other);

    UpstreamResponse {
        status,
        headers,
        body: Body::from_stream(stream),
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        Ok(streamed(response))
    }

    async fn upgrade(&self, request: UpstreamRequest) -> Result<UpgradeOutcome> {
        let response = self
            .upgrade_client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(UpgradeOutcome::Refused(streamed(response)));
        }

        let headers = response.headers().clone();
        let io = response.upgrade().await.map_err(|e| {
            Error::Proxy(format!(
                "failed to upgrade API server connection: {}",
                error_chain(&e)
            ))
        })?;
        Ok(UpgradeOutcome::Switched {
            headers,
            io: Box::new(io),
        })
    }
}
