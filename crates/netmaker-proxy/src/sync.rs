//! External Mapping Sync
//!
//! Pulls the authoritative IP to identity table from the Netmaker server and
//! merges it into the local store. Entries missing from the remote copy are
//! kept; the merge only adds and overwrites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::config::ExternalSyncConfig;
use crate::error::{error_chain, Error, Result};
use crate::mappings::{null_as_default, UserMapping, UserMappingStore};

/// Path of the mapping endpoint on the Netmaker server
pub const MAPPINGS_PATH: &str = "/api/users/network_ip";

/// Timeout for one fetch
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote source of IP to identity mappings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MappingSource: Send + Sync {
    /// Fetch the full remote mapping table
    async fn fetch(&self) -> Result<HashMap<String, UserMapping>>;
}

#[derive(Deserialize)]
struct MappingsResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    mappings: HashMap<String, UserMapping>,
}

/// Fetches mappings from the Netmaker HTTP API
///
/// Certificate verification is disabled for this endpoint; the configured
/// domain is trusted implicitly.
pub struct HttpMappingSource {
    client: reqwest::Client,
    endpoint: String,
    token: Zeroizing<String>,
}

impl HttpMappingSource {
    /// Source for `https://{server_domain}/api/users/network_ip`.
    ///
    /// The URL is parsed on each fetch, so a malformed domain fails the
    /// fetch rather than construction.
    pub fn new(config: &ExternalSyncConfig) -> Result<Self> {
        let endpoint = format!("https://{}{}", config.server_domain, MAPPINGS_PATH);
        Self::with_endpoint(endpoint, config.api_token.clone())
    }

    /// Source for an explicit endpoint URL
    pub fn with_endpoint(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Config(format!("failed to build sync client: {}", error_chain(&e))))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: Zeroizing::new(token.into()),
        })
    }
}

#[async_trait]
impl MappingSource for HttpMappingSource {
    async fn fetch(&self) -> Result<HashMap<String, UserMapping>> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| Error::Sync(format!("invalid request URL {}: {e}", self.endpoint)))?;
        debug!(url = %url, "Fetching user mappings from external API");

        let response = self
            .client
            .get(url)
            .bearer_auth(self.token.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| Error::Sync(format!("failed to make request: {}", error_chain(&e))))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Sync(format!(
                "API request failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let decoded: MappingsResponse = response
            .json()
            .await
            .map_err(|e| Error::Sync(format!("failed to decode response: {}", error_chain(&e))))?;
        Ok(decoded.mappings)
    }
}

/// Merges remote mappings into the local store, on demand or on a ticker
pub struct MappingSync {
    config: ExternalSyncConfig,
    store: Arc<UserMappingStore>,
    source: Option<Arc<dyn MappingSource>>,
}

impl MappingSync {
    /// Create a sync over the Netmaker HTTP API.
    ///
    /// When the domain or token is missing the sync is inert. Failing to
    /// build the HTTP client is logged and also leaves the sync inert.
    pub fn new(config: ExternalSyncConfig, store: Arc<UserMappingStore>) -> Self {
        let source: Option<Arc<dyn MappingSource>> = if config.is_configured() {
            match HttpMappingSource::new(&config) {
                Ok(source) => Some(Arc::new(source)),
                Err(e) => {
                    error!(error = %e, "External API sync disabled");
                    None
                }
            }
        } else {
            None
        };
        Self {
            config,
            store,
            source,
        }
    }

    /// Create a sync over a custom source
    pub fn with_source(
        config: ExternalSyncConfig,
        store: Arc<UserMappingStore>,
        source: Arc<dyn MappingSource>,
    ) -> Self {
        let source = config.is_configured().then_some(source);
        Self {
            config,
            store,
            source,
        }
    }

    /// Whether a remote source is configured
    pub fn is_configured(&self) -> bool {
        self.source.is_some()
    }

    /// Configured Netmaker server domain
    pub fn server_domain(&self) -> &str {
        &self.config.server_domain
    }

    /// Fetch once and merge into the store, returning the number of entries written.
    ///
    /// Does nothing when unconfigured.
    pub async fn fetch_once(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(0);
        };

        let mappings = source.fetch().await?;
        let count = mappings.len();
        info!(count, "Updating user mappings from external API");

        for (ip, mapping) in mappings {
            debug!(ip = %ip, user = %mapping.user, groups = ?mapping.groups, "Updated user mapping");
            self.store.set(ip, mapping);
        }
        Ok(count)
    }

    /// Fetch immediately, then every `sync_interval` until `cancel` fires.
    ///
    /// Failures are logged and the loop continues on the next tick.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        if !self.is_configured() {
            info!("External API not configured, skipping sync");
            return;
        }

        info!(
            server = %self.config.server_domain,
            interval_secs = self.config.sync_interval.as_secs(),
            "Starting external API sync"
        );

        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping external API sync");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.fetch_once().await {
                        error!(error = %e, "Failed to sync user mappings from external API");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn configured() -> ExternalSyncConfig {
        ExternalSyncConfig {
            server_domain: "netmaker.example".into(),
            api_token: "token".into(),
            sync_interval: Duration::from_secs(30),
        }
    }

    fn payload(entries: &[(&str, &str)]) -> HashMap<String, UserMapping> {
        entries
            .iter()
            .map(|(ip, user)| (ip.to_string(), UserMapping::new(*user, vec!["devs".into()])))
            .collect()
    }

    #[tokio::test]
    async fn test_unconfigured_sync_is_a_no_op() {
        let mut source = MockMappingSource::new();
        source.expect_fetch().times(0);

        let store = Arc::new(UserMappingStore::new());
        let sync = MappingSync::with_source(ExternalSyncConfig::default(), store.clone(), Arc::new(source));

        assert!(!sync.is_configured());
        assert_eq!(sync.fetch_once().await.unwrap(), 0);
        sync.run_periodic(CancellationToken::new()).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fetching_same_payload_twice_is_idempotent() {
        let mut source = MockMappingSource::new();
        source
            .expect_fetch()
            .times(2)
            .returning(|| Ok(payload(&[("10.0.0.1", "alice"), ("10.0.0.2", "bob")])));

        let store = Arc::new(UserMappingStore::new());
        let sync = MappingSync::with_source(configured(), store.clone(), Arc::new(source));

        sync.fetch_once().await.unwrap();
        let once = store.all();
        sync.fetch_once().await.unwrap();

        assert_eq!(store.all(), once);
        assert_eq!(once.len(), 2);
    }

    #[tokio::test]
    async fn test_disjoint_payloads_merge_into_union() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut source = MockMappingSource::new();
        source.expect_fetch().times(2).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(payload(&[("10.0.0.1", "alice")]))
            } else {
                Ok(payload(&[("10.0.0.2", "bob")]))
            }
        });

        let store = Arc::new(UserMappingStore::new());
        store.set("10.0.0.9", UserMapping::new("local-only", vec![]));
        let sync = MappingSync::with_source(configured(), store.clone(), Arc::new(source));

        assert_eq!(sync.fetch_once().await.unwrap(), 1);
        assert_eq!(sync.fetch_once().await.unwrap(), 1);

        let all = store.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all["10.0.0.1"].user, "alice");
        assert_eq!(all["10.0.0.2"].user, "bob");
        assert_eq!(all["10.0.0.9"].user, "local-only");
    }

    #[tokio::test]
    async fn test_remote_entry_overwrites_local() {
        let mut source = MockMappingSource::new();
        source
            .expect_fetch()
            .returning(|| Ok(payload(&[("10.0.0.1", "remote-alice")])));

        let store = Arc::new(UserMappingStore::new());
        store.set("10.0.0.1", UserMapping::new("local-alice", vec!["admins".into()]));
        let sync = MappingSync::with_source(configured(), store.clone(), Arc::new(source));

        sync.fetch_once().await.unwrap();
        assert_eq!(
            store.get("10.0.0.1"),
            Some(UserMapping::new("remote-alice", vec!["devs".into()]))
        );
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_from_fetch_once() {
        let mut source = MockMappingSource::new();
        source
            .expect_fetch()
            .returning(|| Err(Error::Sync("API request failed with status 503: down".into())));

        let store = Arc::new(UserMappingStore::new());
        let sync = MappingSync::with_source(configured(), store.clone(), Arc::new(source));

        assert!(matches!(sync.fetch_once().await, Err(Error::Sync(_))));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_fetches_immediately_then_on_each_tick() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut source = MockMappingSource::new();
        source.expect_fetch().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Sync("unreachable".into()))
        });

        let store = Arc::new(UserMappingStore::new());
        let sync = Arc::new(MappingSync::with_source(configured(), store, Arc::new(source)));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let sync = Arc::clone(&sync);
            let cancel = cancel.clone();
            async move { sync.run_periodic(cancel).await }
        });

        // Ticks at 0s, 30s and 60s; failures do not stop the loop
        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    mod http {
        use super::*;
        use axum::http::{HeaderMap, StatusCode};
        use axum::routing::get;
        use axum::{Json, Router};

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
            format!("http://{addr}{MAPPINGS_PATH}")
        }

        #[tokio::test]
        async fn test_http_source_sends_bearer_token_and_decodes_mappings() {
            let router = Router::new().route(
                MAPPINGS_PATH,
                get(|headers: HeaderMap| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok())
                        != Some("Bearer secret-token")
                    {
                        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "mappings": {
                                "10.0.0.1": {"user": "alice", "groups": ["developers"]},
                                "10.0.0.2": {"user": "bob"}
                            }
                        })),
                    )
                }),
            );
            let endpoint = serve(router).await;

            let source = HttpMappingSource::with_endpoint(endpoint, "secret-token").unwrap();
            let mappings = source.fetch().await.unwrap();

            assert_eq!(mappings.len(), 2);
            assert_eq!(
                mappings["10.0.0.1"],
                UserMapping::new("alice", vec!["developers".into()])
            );
            assert!(mappings["10.0.0.2"].groups.is_empty());
        }

        #[tokio::test]
        async fn test_http_source_non_200_carries_body() {
            let router = Router::new().route(
                MAPPINGS_PATH,
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance window") }),
            );
            let endpoint = serve(router).await;

            let source = HttpMappingSource::with_endpoint(endpoint, "t").unwrap();
            let err = source.fetch().await.unwrap_err().to_string();

            assert!(err.contains("503"), "{err}");
            assert!(err.contains("maintenance window"), "{err}");
        }

        #[tokio::test]
        async fn test_http_source_rejects_malformed_body() {
            let router = Router::new().route(MAPPINGS_PATH, get(|| async { "not json" }));
            let endpoint = serve(router).await;

            let source = HttpMappingSource::with_endpoint(endpoint, "t").unwrap();
            let err = source.fetch().await.unwrap_err().to_string();
            assert!(err.contains("failed to decode response"), "{err}");
        }

        #[test]
        fn test_endpoint_uses_https_and_fixed_path() {
            let source = HttpMappingSource::new(&configured()).unwrap();
            assert_eq!(source.endpoint, "https://netmaker.example/api/users/network_ip");
        }

        #[tokio::test]
        async fn test_null_groups_decode_as_empty() {
            let router = Router::new().route(
                MAPPINGS_PATH,
                get(|| async {
                    (
                        [("content-type", "application/json")],
                        r#"{"mappings":{"10.0.0.1":{"user":"alice","groups":null},"10.0.0.2":{"user":"bob","groups":["ops"]}}}"#,
                    )
                }),
            );
            let endpoint = serve(router).await;

            let store = Arc::new(UserMappingStore::new());
            let source = HttpMappingSource::with_endpoint(endpoint, "t").unwrap();
            let sync = MappingSync::with_source(configured(), store.clone(), Arc::new(source));

            assert_eq!(sync.fetch_once().await.unwrap(), 2);
            assert_eq!(store.get("10.0.0.1"), Some(UserMapping::new("alice", vec![])));
            assert_eq!(store.get("10.0.0.2"), Some(UserMapping::new("bob", vec!["ops".into()])));
        }

        #[tokio::test]
        async fn test_null_mappings_merge_nothing() {
            let router = Router::new().route(
                MAPPINGS_PATH,
                get(|| async { ([("content-type", "application/json")], r#"{"mappings":null}"#) }),
            );
            let endpoint = serve(router).await;

            let source = HttpMappingSource::with_endpoint(endpoint, "t").unwrap();
            assert!(source.fetch().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_malformed_domain_fails_each_fetch() {
            let config = ExternalSyncConfig {
                server_domain: "net maker.example".into(),
                ..configured()
            };
            let store = Arc::new(UserMappingStore::new());
            let sync = MappingSync::new(config, store.clone());

            assert!(sync.is_configured());
            for _ in 0..2 {
                let err = sync.fetch_once().await.unwrap_err();
                assert!(matches!(err, Error::Sync(_)), "{err}");
            }
            assert!(store.is_empty());
        }
    }
}
