//! Error types for the overlay API proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No upstream credential is configured and the caller sent none
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The running proxy mode is not one the middleware understands
    #[error("unknown proxy mode: {0}")]
    InvalidProxyMode(String),

    /// Malformed management API request
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Summary returned as the `error` field
        message: String,
        /// Underlying cause returned as the `details` field
        details: Option<String>,
    },

    /// External mapping sync is not configured
    #[error("External API not configured")]
    SyncNotConfigured,

    /// External mapping sync request failed
    #[error("sync error: {0}")]
    Sync(String),

    /// Forwarding to the Kubernetes API server failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Startup configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: std::net::SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::InvalidRequest`] with details
    pub fn invalid_request(message: impl Into<String>, details: impl Into<String>) -> Self {
        Error::InvalidRequest {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    /// HTTP status returned to the caller for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest { .. } | Error::SyncNotConfigured => StatusCode::BAD_REQUEST,
            Error::Proxy(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidProxyMode(_)
            | Error::Sync(_)
            | Error::Config(_)
            | Error::Bind { .. }
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Callers see a short fixed message; the cause goes into `details`
        // only for management API errors.
        let body = match self {
            Error::Unauthorized(_) => serde_json::json!({ "error": "Proxy authentication required" }),
            Error::InvalidProxyMode(_) => {
                serde_json::json!({ "error": "Invalid proxy configuration" })
            }
            Error::InvalidRequest {
                message,
                details: Some(details),
            } => serde_json::json!({ "error": message, "details": details }),
            Error::InvalidRequest {
                message,
                details: None,
            } => serde_json::json!({ "error": message }),
            Error::SyncNotConfigured => serde_json::json!({ "error": "External API not configured" }),
            Error::Sync(details) => serde_json::json!({
                "error": "Failed to sync from external API",
                "details": details,
            }),
            Error::Proxy(_) => serde_json::json!({ "error": "upstream error" }),
            Error::Config(message) | Error::Internal(message) => {
                serde_json::json!({ "error": message })
            }
            Error::Bind { .. } => serde_json::json!({ "error": "internal error" }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Proxy(error_chain(&e))
    }
}

/// Render an error with all of its sources, outermost first.
///
/// reqwest and hyper keep the useful part of a failure (for example
/// "connection reset by peer") in the source chain rather than in `Display`.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(error: Error) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_unauthorized_response() {
        let (status, body) = body_json(Error::Unauthorized("no credentials".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Proxy authentication required");
    }

    #[tokio::test]
    async fn test_invalid_mode_response() {
        let (status, body) = body_json(Error::InvalidProxyMode("sideways".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Invalid proxy configuration");
    }

    #[tokio::test]
    async fn test_proxy_error_is_bad_gateway() {
        let (status, body) = body_json(Error::Proxy("connection refused".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "upstream error");
    }

    #[tokio::test]
    async fn test_sync_errors() {
        let (status, body) = body_json(Error::SyncNotConfigured).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "External API not configured");

        let (status, body) = body_json(Error::Sync("status 503".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to sync from external API");
        assert_eq!(body["details"], "status 503");
    }

    #[tokio::test]
    async fn test_invalid_request_carries_details() {
        let (status, body) =
            body_json(Error::invalid_request("Invalid request format", "missing field `ip`")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid request format");
        assert_eq!(body["details"], "missing field `ip`");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "client disconnected");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        assert!(error_chain(&outer).contains("client disconnected"));
    }
}
