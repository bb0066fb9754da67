//! HTTPS server that requests, but does not require, client certificates.
//!
//! ```text
//! ServerTlsConfig ──new──▶ MutualTlsServer ──bind──▶ BoundServer ──serve(router)──▶ ()
//! ```
//!
//! A client certificate, when presented, must chain to one of the trusted
//! client CAs or the handshake fails.  Clients without a certificate complete
//! the handshake and reach the router as anonymous callers.

pub mod listener;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub use listener::{HANDSHAKE_TIMEOUT, MtlsListener, MtlsStream, PeerCertificates};

use crate::pki::{TrustPool, load_certs, load_private_key};
use crate::{Error, Result};

/// Server TLS configuration.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    /// Listen address; port `0` picks a free port.
    pub bind: SocketAddr,
    /// PEM certificate presented to clients.
    pub cert_file: PathBuf,
    /// PEM private key of `cert_file`.
    pub key_file: PathBuf,
    /// PEM CA certificates trusted for client certificates.
    pub client_ca_files: Vec<PathBuf>,
}

/// The process-wide rustls crypto provider (aws-lc-rs).
///
/// Also installs it as the default so TLS clients built elsewhere in the
/// process agree on it.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    if let Some(installed) = CryptoProvider::get_default() {
        return Arc::clone(installed);
    }
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    // Losing the race to another thread is fine, it installed the same provider.
    let _ = provider.clone().install_default();
    Arc::new(provider)
}

/// Build the rustls server configuration.
///
/// # Errors
///
/// Returns an error if certificate, key or CA files cannot be loaded, or the
/// certificate does not match the key.
pub fn build_tls_config(config: &ServerTlsConfig) -> Result<Arc<ServerConfig>> {
    let server_certs = load_certs(&config.cert_file)?;
    let server_key = load_private_key(&config.key_file)?;

    let mut client_cas = TrustPool::new();
    for path in &config.client_ca_files {
        for cert in load_certs(path)? {
            client_cas.add_der(cert)?;
        }
    }

    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?;

    let builder = if client_cas.is_empty() {
        builder.with_no_client_auth()
    } else {
        let verifier = WebPkiClientVerifier::builder_with_provider(client_cas.root_store()?, provider)
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    };

    let mut tls_cfg = builder
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        cert_file = %config.cert_file.display(),
        client_cas = client_cas.len(),
        "Server TLS config built"
    );

    Ok(Arc::new(tls_cfg))
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// HTTPS server with optional client-certificate authentication.
pub struct MutualTlsServer {
    bind: SocketAddr,
    acceptor: TlsAcceptor,
}

impl MutualTlsServer {
    /// Load key material and prepare the TLS acceptor.
    ///
    /// # Errors
    ///
    /// See [`build_tls_config`].
    pub fn new(config: &ServerTlsConfig) -> Result<Self> {
        let tls = build_tls_config(config)?;
        Ok(Self {
            bind: config.bind,
            acceptor: TlsAcceptor::from(tls),
        })
    }

    /// Configured listen address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn bind(self) -> Result<BoundServer> {
        let tcp = TcpListener::bind(self.bind).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {}: {e}", self.bind),
            ))
        })?;
        let listener = MtlsListener::new(tcp, self.acceptor)?;
        Ok(BoundServer { listener })
    }

    /// Bind and serve `router` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn serve(self, router: Router) -> Result<()> {
        self.bind().await?.serve(router).await
    }
}

/// A server whose socket is bound but not yet serving.
pub struct BoundServer {
    listener: MtlsListener,
}

impl BoundServer {
    /// Actual listen address (resolves port `0`).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.bound_addr()
    }

    /// Serve `router` until Ctrl+C or SIGTERM.
    ///
    /// Handlers can extract `ConnectInfo<PeerCertificates>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server stops abnormally.
    pub async fn serve(self, router: Router) -> Result<()> {
        let addr = self.local_addr();
        info!(%addr, "Listening (HTTPS, client certificates optional)");

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<PeerCertificates>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!(%addr, "Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
