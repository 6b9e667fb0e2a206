//! Kubernetes client credentials
//!
//! Resolves, once at startup, where the API server lives and how the proxy
//! authenticates itself to it. This is the proxy's own identity; who the
//! caller claims to be is handled by impersonation in [`crate::auth`].

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use netmaker_common::env::non_empty;
use netmaker_common::EnvSource;
use secrecy::ExposeSecret;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// How the proxy authenticates to the API server
#[derive(Clone)]
pub enum UpstreamAuth {
    /// Static bearer token
    BearerToken(Zeroizing<String>),
    /// Bearer token re-read from a file on every request
    BearerTokenFile(PathBuf),
    /// TLS client certificate; certificate and key PEM blocks concatenated
    ClientCertificate {
        /// Certificate chain followed by the private key, PEM encoded
        identity_pem: Zeroizing<Vec<u8>>,
    },
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: Zeroizing<String>,
    },
    /// No credential; callers must bring their own `Authorization` header
    None,
}

impl fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAuth::BearerToken(_) => f.write_str("BearerToken([REDACTED])"),
            UpstreamAuth::BearerTokenFile(path) => write!(f, "BearerTokenFile({})", path.display()),
            UpstreamAuth::ClientCertificate { .. } => f.write_str("ClientCertificate([REDACTED])"),
            UpstreamAuth::Basic { username, .. } => write!(f, "Basic({username}, [REDACTED])"),
            UpstreamAuth::None => f.write_str("None"),
        }
    }
}

impl UpstreamAuth {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamAuth::BearerToken(_) => "bearer_token",
            UpstreamAuth::BearerTokenFile(_) => "bearer_token_file",
            UpstreamAuth::ClientCertificate { .. } => "client_certificate",
            UpstreamAuth::Basic { .. } => "basic",
            UpstreamAuth::None => "none",
        }
    }
}

/// Where the API server is and how to reach it
#[derive(Debug)]
pub struct ClusterCredentials {
    /// Base URL of the API server
    pub api_server: reqwest::Url,
    /// Proxy's own credential
    pub auth: UpstreamAuth,
    /// Cluster CA certificates, DER encoded
    pub root_certs: Vec<Vec<u8>>,
}

/// Where credentials are loaded from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Pod service account
    InCluster,
    /// Kubeconfig file, using its current context
    Kubeconfig(PathBuf),
}

impl CredentialSource {
    /// Pick the credential source.
    ///
    /// An explicit `in_cluster` flag wins; otherwise the pod environment is
    /// detected from `KUBERNETES_SERVICE_HOST`.
    pub fn select(
        in_cluster: Option<bool>,
        env: &dyn EnvSource,
        kubeconfig: Option<PathBuf>,
    ) -> Result<Self> {
        let in_cluster =
            in_cluster.unwrap_or_else(|| non_empty(env, "KUBERNETES_SERVICE_HOST").is_some());

        if in_cluster {
            return Ok(CredentialSource::InCluster);
        }

        kubeconfig.map(CredentialSource::Kubeconfig).ok_or_else(|| {
            Error::Config("not running in-cluster and neither KUBECONFIG nor HOME is set".into())
        })
    }
}

impl ClusterCredentials {
    /// Load credentials from `source`
    pub async fn load(source: &CredentialSource) -> Result<Self> {
        let config = match source {
            CredentialSource::InCluster => kube::Config::incluster()
                .map_err(|e| Error::Config(format!("failed to load in-cluster config: {e}")))?,
            CredentialSource::Kubeconfig(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::Config(format!("failed to load kubeconfig {}: {e}", path.display()))
                    })?
            }
        };

        let api_server = reqwest::Url::parse(&config.cluster_url.to_string()).map_err(|e| {
            Error::Config(format!("invalid API server URL {}: {e}", config.cluster_url))
        })?;
        let auth = upstream_auth(&config.auth_info)?;

        info!(
            api_server = %api_server,
            credential = auth.kind(),
            "Loaded Kubernetes credentials"
        );

        Ok(Self {
            api_server,
            auth,
            root_certs: config.root_cert.unwrap_or_default(),
        })
    }
}

/// Translate a kubeconfig user entry into the proxy's upstream credential.
///
/// Precedence: token, token file, client certificate, basic auth. Exec and
/// auth-provider plugins are not supported and fall through to `None`.
pub fn upstream_auth(info: &AuthInfo) -> Result<UpstreamAuth> {
    if let Some(token) = &info.token {
        let token = token.expose_secret();
        if !token.is_empty() {
            return Ok(UpstreamAuth::BearerToken(Zeroizing::new(token.to_string())));
        }
    }

    if let Some(path) = info.token_file.as_deref().filter(|p| !p.is_empty()) {
        return Ok(UpstreamAuth::BearerTokenFile(PathBuf::from(path)));
    }

    let cert = pem_material(
        info.client_certificate.as_deref(),
        info.client_certificate_data.as_deref(),
        "client certificate",
    )?;
    let key = pem_material(
        info.client_key.as_deref(),
        info.client_key_data.as_ref().map(|k| k.expose_secret()),
        "client key",
    )?;
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let mut identity_pem = Zeroizing::new(cert.to_vec());
            if !identity_pem.ends_with(b"\n") {
                identity_pem.push(b'\n');
            }
            identity_pem.extend_from_slice(&key);
            return Ok(UpstreamAuth::ClientCertificate { identity_pem });
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!("Client certificate and key must both be set, ignoring the one provided");
        }
        (None, None) => {}
    }

    let username = info.username.as_deref().filter(|u| !u.is_empty());
    let password = info
        .password
        .as_ref()
        .map(|p| p.expose_secret())
        .filter(|p| !p.is_empty());
    if let (Some(username), Some(password)) = (username, password) {
        return Ok(UpstreamAuth::Basic {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        });
    }

    if info.exec.is_some() || info.auth_provider.is_some() {
        warn!("Kubeconfig exec and auth-provider plugins are not supported");
    }
    Ok(UpstreamAuth::None)
}

/// Inline base64 data wins over a file path
fn pem_material(
    path: Option<&str>,
    data: Option<&str>,
    what: &str,
) -> Result<Option<Zeroizing<Vec<u8>>>> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::Config(format!("invalid base64 {what} data: {e}")))?;
        return Ok(Some(Zeroizing::new(decoded)));
    }

    if let Some(path) = path.filter(|p| !p.is_empty()) {
        let contents = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read {what} {path}: {e}")))?;
        return Ok(Some(Zeroizing::new(contents)));
    }

    Ok(None)
}

/// Reads bearer tokens from disk
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenReader: Send + Sync {
    /// Read the token stored at `path`
    async fn read_token(&self, path: &Path) -> Result<Zeroizing<String>>;
}

/// [`TokenReader`] over the filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct FileTokenReader;

#[async_trait]
impl TokenReader for FileTokenReader {
    async fn read_token(&self, path: &Path) -> Result<Zeroizing<String>> {
        let contents = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Internal(format!("failed to read token file {}: {e}", path.display()))
        })?);
        Ok(Zeroizing::new(contents.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_select_explicit_flag_wins() {
        let env = vars(&[("KUBERNETES_SERVICE_HOST", "10.96.0.1")]);
        let source =
            CredentialSource::select(Some(false), &env, Some(PathBuf::from("/kc"))).unwrap();
        assert_eq!(source, CredentialSource::Kubeconfig(PathBuf::from("/kc")));

        let source = CredentialSource::select(Some(true), &vars(&[]), None).unwrap();
        assert_eq!(source, CredentialSource::InCluster);
    }

    #[test]
    fn test_select_detects_pod_environment() {
        let env = vars(&[("KUBERNETES_SERVICE_HOST", "10.96.0.1")]);
        assert_eq!(
            CredentialSource::select(None, &env, Some(PathBuf::from("/kc"))).unwrap(),
            CredentialSource::InCluster
        );
    }

    #[test]
    fn test_select_without_kubeconfig_fails() {
        let err = CredentialSource::select(None, &vars(&[]), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_token_takes_precedence() {
        let info = AuthInfo {
            token: Some(SecretString::from("static-token".to_string())),
            token_file: Some("/var/run/token".into()),
            username: Some("admin".into()),
            ..Default::default()
        };
        match upstream_auth(&info).unwrap() {
            UpstreamAuth::BearerToken(token) => assert_eq!(token.as_str(), "static-token"),
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn test_token_file_is_kept_as_path() {
        let info = AuthInfo {
            token_file: Some("/var/run/secrets/kubernetes.io/serviceaccount/token".into()),
            ..Default::default()
        };
        assert!(matches!(
            upstream_auth(&info).unwrap(),
            UpstreamAuth::BearerTokenFile(path) if path.ends_with("serviceaccount/token")
        ));
    }

    #[test]
    fn test_inline_client_certificate_data() {
        let engine = base64::engine::general_purpose::STANDARD;
        let info = AuthInfo {
            client_certificate_data: Some(engine.encode("CERT-PEM")),
            client_key_data: Some(SecretString::from(engine.encode("KEY-PEM\n"))),
            ..Default::default()
        };
        match upstream_auth(&info).unwrap() {
            UpstreamAuth::ClientCertificate { identity_pem } => {
                assert_eq!(identity_pem.as_slice(), b"CERT-PEM\nKEY-PEM\n");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn test_client_certificate_files() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "CERT-FILE").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "KEY-FILE").unwrap();

        let info = AuthInfo {
            client_certificate: Some(cert.path().to_string_lossy().into_owned()),
            client_key: Some(key.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        match upstream_auth(&info).unwrap() {
            UpstreamAuth::ClientCertificate { identity_pem } => {
                assert_eq!(identity_pem.as_slice(), b"CERT-FILE\nKEY-FILE\n");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn test_missing_certificate_file_is_an_error() {
        let info = AuthInfo {
            client_certificate: Some("/nonexistent/client.crt".into()),
            client_key: Some("/nonexistent/client.key".into()),
            ..Default::default()
        };
        assert!(matches!(upstream_auth(&info), Err(Error::Config(_))));
    }

    #[test]
    fn test_basic_auth_and_none() {
        let info = AuthInfo {
            username: Some("admin".into()),
            password: Some(SecretString::from("hunter2".to_string())),
            ..Default::default()
        };
        match upstream_auth(&info).unwrap() {
            UpstreamAuth::Basic { username, password } => {
                assert_eq!(username, "admin");
                assert_eq!(password.as_str(), "hunter2");
            }
            other => panic!("unexpected credential {other:?}"),
        }

        assert!(matches!(
            upstream_auth(&AuthInfo::default()).unwrap(),
            UpstreamAuth::None
        ));
    }

    #[test]
    fn test_basic_auth_needs_username_and_password() {
        let username_only = AuthInfo {
            username: Some("admin".into()),
            ..Default::default()
        };
        assert!(matches!(upstream_auth(&username_only).unwrap(), UpstreamAuth::None));

        let empty_password = AuthInfo {
            username: Some("admin".into()),
            password: Some(SecretString::from(String::new())),
            ..Default::default()
        };
        assert!(matches!(upstream_auth(&empty_password).unwrap(), UpstreamAuth::None));

        let password_only = AuthInfo {
            password: Some(SecretString::from("hunter2".to_string())),
            ..Default::default()
        };
        assert!(matches!(upstream_auth(&password_only).unwrap(), UpstreamAuth::None));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = UpstreamAuth::BearerToken(Zeroizing::new("abc123".into()));
        assert!(!format!("{auth:?}").contains("abc123"));
        let auth = UpstreamAuth::Basic {
            username: "admin".into(),
            password: Zeroizing::new("hunter2".into()),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_load_from_kubeconfig_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"apiVersion: v1
kind: Config
clusters:
- name: overlay
  cluster:
    server: https://10.96.0.1:6443
    insecure-skip-tls-verify: true
users:
- name: proxy
  user:
    token: kubeconfig-token
contexts:
- name: overlay
  context:
    cluster: overlay
    user: proxy
current-context: overlay
"#
        )
        .unwrap();

        let source = CredentialSource::Kubeconfig(file.path().to_path_buf());
        let credentials = ClusterCredentials::load(&source).await.unwrap();

        assert_eq!(credentials.api_server.as_str(), "https://10.96.0.1:6443/");
        assert!(credentials.root_certs.is_empty());
        match credentials.auth {
            UpstreamAuth::BearerToken(token) => assert_eq!(token.as_str(), "kubeconfig-token"),
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_missing_kubeconfig_fails() {
        let source = CredentialSource::Kubeconfig(PathBuf::from("/nonexistent/kubeconfig"));
        assert!(matches!(
            ClusterCredentials::load(&source).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_file_token_reader_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  rotated-token  ").unwrap();

        let token = FileTokenReader.read_token(file.path()).await.unwrap();
        assert_eq!(token.as_str(), "rotated-token");
    }
}
