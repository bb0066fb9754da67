//! Gateway-side delegation to the backend.
//!
//! The gateway talks to the backend over mutual TLS: it presents its
//! request-header client certificate and trusts only the backend's CA for the
//! server certificate.  The inbound caller's identity travels in the
//! forwarded-identity header.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::{Certificate, Client, Identity};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::server::crypto_provider;
use crate::{Error, Result};

/// Settings of one [`ProxyForwarder`].
#[derive(Clone)]
pub struct ForwarderConfig {
    /// Base URL of the backend, e.g. `https://127.0.0.2:8443`.
    pub backend_url: String,
    /// PEM certificate presented to the backend.
    pub client_cert_pem: String,
    /// PEM private key of `client_cert_pem`.
    pub client_key_pem: String,
    /// PEM CA certificate trusted for the backend's server certificate.
    pub backend_ca_pem: Vec<u8>,
    /// Timeout of one forwarded call.
    pub timeout: Duration,
    /// Maximum concurrent forwarded calls.
    pub pool_size: usize,
    /// Forwarded-identity header name.
    pub username_header: String,
}

impl std::fmt::Debug for ForwarderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderConfig")
            .field("backend_url", &self.backend_url)
            .field("client_key_pem", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("pool_size", &self.pool_size)
            .field("username_header", &self.username_header)
            .finish_non_exhaustive()
    }
}

/// Backend response relayed to the original caller.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    /// Backend status code.
    pub status: StatusCode,
    /// Backend `Content-Type`, if any.
    pub content_type: Option<HeaderValue>,
    /// Backend body, unchanged.
    pub body: Bytes,
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(ct) = self.content_type {
            response.headers_mut().insert(CONTENT_TYPE, ct);
        }
        response
    }
}

/// Forwards requests to the backend under the gateway's own identity.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: Client,
    base_url: String,
    username_header: HeaderName,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl ProxyForwarder {
    /// Build the outbound client.
    ///
    /// # Errors
    ///
    /// Returns an error if the key material or header name is invalid.
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::Config("Forwarder pool size must be at least 1".to_string()));
        }
        let username_header = HeaderName::try_from(config.username_header.as_str())
            .map_err(|e| Error::Config(format!("Invalid header '{}': {e}", config.username_header)))?;

        let combined = format!("{}\n{}", config.client_cert_pem, config.client_key_pem);
        let identity = Identity::from_pem(combined.as_bytes())
            .map_err(|e| Error::Tls(format!("Invalid forwarder client identity: {e}")))?;
        let backend_ca = Certificate::from_pem(&config.backend_ca_pem)
            .map_err(|e| Error::Tls(format!("Invalid backend CA certificate: {e}")))?;

        let _ = crypto_provider();
        let client = Client::builder()
            .identity(identity)
            .tls_certs_only([backend_ca])
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build forwarder client: {e}")))?;

        debug!(
            backend = %config.backend_url,
            pool_size = config.pool_size,
            timeout = ?config.timeout,
            "Proxy forwarder ready"
        );

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            username_header,
            permits: Arc::new(Semaphore::new(config.pool_size)),
            pool_size: config.pool_size,
        })
    }

    /// Backend base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Maximum concurrent forwarded calls.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Forwarded calls currently allowed to start without waiting.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Forward one request.
    ///
    /// `path_and_query` is appended to the backend base URL.  Only
    /// `Content-Type` is copied from `headers`; the forwarded-identity header
    /// is set from `caller` alone and omitted when there is no caller.
    /// Waits for a free slot when `pool_size` calls are already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on dial, TLS or timeout failure.  No
    /// retry is attempted.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        caller: Option<&str>,
    ) -> Result<ForwardedResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("Forwarder pool closed".to_string()))?;

        let url = self.url_for(path_and_query);
        let mut request = self.client.request(method.clone(), &url).body(body);
        if let Some(ct) = headers.get(CONTENT_TYPE) {
            request = request.header(CONTENT_TYPE, ct.clone());
        }
        match caller.filter(|c| !c.is_empty()) {
            Some(user) => request = request.header(self.username_header.clone(), user),
            None => debug!(%url, "Forwarding without caller identity"),
        }

        let response = request.send().await.map_err(|e| {
            warn!(%method, %url, error = %e, "Backend request failed");
            Error::Transport(format!("{method} {url}: {e}"))
        })?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read backend response: {e}")))?;

        debug!(%method, %url, %status, bytes = body.len(), "Backend responded");

        Ok(ForwardedResponse {
            status,
            content_type,
            body,
        })
    }

    fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.base_url)
        } else {
            format!("{}/{path_and_query}", self.base_url)
        }
    }
}
