//! `reqwest` implementation of [`JsonClient`].
//!
//! Enabled by the `http-reqwest` feature (on by default).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

use crate::api::{JsonClient, Method};
use crate::error::{Result, TeamSyncError};
use crate::identity::IdentityProvider;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`HttpJsonClient`].
///
/// # Example
///
/// ```
/// use teamsync_client::http::HttpConfig;
/// use std::time::Duration;
///
/// let config = HttpConfig::new("http://localhost:8000/")
///     .with_timeout(Duration::from_secs(5));
/// assert_eq!(config.base_url, "http://localhost:8000");
/// ```
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Service base URL without a trailing slash.
    pub base_url: String,
    /// Per-request timeout. Defaults to **10 seconds**.
    pub timeout: Duration,
}

impl HttpConfig {
    /// Create a configuration for `base_url` with default values.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// JSON-over-HTTP client that attaches the identity's bearer token on every
/// request.
pub struct HttpJsonClient {
    config: HttpConfig,
    client: Client,
    identity: Arc<dyn IdentityProvider>,
}

impl HttpJsonClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns [`TeamSyncError::Network`] if the underlying HTTP client cannot
    /// be constructed (e.g. TLS backend initialisation failure).
    pub fn new(config: HttpConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            identity,
        })
    }
}

/// Pull a readable message out of an error body.
///
/// Understands `{"detail": "..."}` and validation lists of the form
/// `{"detail": [{"msg": "..."}]}`.
fn extract_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::String(detail) => Some(detail.clone()),
        Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    }
}

#[async_trait]
impl JsonClient for HttpJsonClient {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(%method, %url, "api request");

        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(token) = self.identity.token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            debug!(%method, %url, status = status.as_u16(), "api request failed");
            return Err(TeamSyncError::Api {
                status: status.as_u16(),
                detail: extract_detail(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(TeamSyncError::from)
    }
}

impl std::fmt::Debug for HttpJsonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonClient")
            .field("base_url", &self.config.base_url)
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::identity::{StoredIdentity, UserIdentity};
    use crate::store::MemoryStorage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn detail_extraction() {
        assert_eq!(
            extract_detail(r#"{"detail":"Already queued"}"#).as_deref(),
            Some("Already queued")
        );
        assert_eq!(
            extract_detail(r#"{"detail":[{"msg":"a"},{"msg":"b"}]}"#).as_deref(),
            Some("a; b")
        );
        assert_eq!(extract_detail("<html>oops</html>"), None);
        assert_eq!(extract_detail(r#"{"error":"x"}"#), None);
    }

    /// Serve exactly one canned HTTP response and hand back the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), task)
    }

    fn signed_in_identity() -> Arc<dyn IdentityProvider> {
        let identity = StoredIdentity::new(Arc::new(MemoryStorage::new()));
        identity.sign_in(&UserIdentity::new("u1"), "tok-123").unwrap();
        Arc::new(identity)
    }

    #[tokio::test]
    async fn injects_bearer_token_and_parses_body() {
        let (url, server) = serve_once(concat!(
            "HTTP/1.1 200 OK\r\n",
            "content-type: application/json\r\n",
            "content-length: 17\r\n",
            "connection: close\r\n\r\n",
            "{\"status\":\"idle\"}",
        ))
        .await;
        let client = HttpJsonClient::new(HttpConfig::new(url), signed_in_identity()).unwrap();
        let value = client
            .request(Method::Get, "/matchmaking/status", None)
            .await
            .unwrap();
        assert_eq!(value["status"], "idle");

        let raw_request = server.await.unwrap().to_ascii_lowercase();
        assert!(raw_request.starts_with("get /matchmaking/status"));
        assert!(raw_request.contains("authorization: bearer tok-123"));
    }

    #[tokio::test]
    async fn error_status_carries_detail() {
        let (url, _server) = serve_once(concat!(
            "HTTP/1.1 401 Unauthorized\r\n",
            "content-type: application/json\r\n",
            "content-length: 30\r\n",
            "connection: close\r\n\r\n",
            "{\"detail\":\"Token has expired\"}",
        ))
        .await;
        let client = HttpJsonClient::new(HttpConfig::new(url), signed_in_identity()).unwrap();
        let err = client
            .request(Method::Post, "/matchmaking/join", None)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.user_message(), "Token has expired");
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let (url, _server) =
            serve_once("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        let client = HttpJsonClient::new(HttpConfig::new(url), signed_in_identity()).unwrap();
        let value = client
            .request(Method::Post, "/matchmaking/leave", None)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let client = HttpJsonClient::new(
            HttpConfig::new("http://127.0.0.1:1").with_timeout(Duration::from_secs(2)),
            signed_in_identity(),
        )
        .unwrap();
        let err = client.request(Method::Get, "/rooms/", None).await.unwrap_err();
        assert!(matches!(err, TeamSyncError::Network(_) | TeamSyncError::Timeout));
    }
}
