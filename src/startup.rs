//! Startup sequences of the gateway and the backend.
//!
//! Each step (CA init, pair issuance and persistence, peer CA loading, TLS
//! setup) returns a `Result`; the first failure aborts startup and is handed
//! back to the caller.  Nothing is served until every step succeeded.
//!
//! Both services share one store directory.  Each CA gets its own
//! [`CertStore`] instance, so file names are prefixed by the CA name:
//!
//! ```text
//! apiserver-ca.crt      apiserver-tls.crt      apiserver-rudro.crt
//! requestheader-ca.crt  requestheader-apiserver.rudro.crt
//! database-ca.crt       database-tls.crt       database-deb.crt
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::http::HeaderName;
use tracing::info;

use crate::config::Config;
use crate::pki::{AltNames, CA_PAIR_NAME, CertStore, PairPaths, TrustPool};
use crate::proxy::{ForwarderConfig, ProxyForwarder};
use crate::routes::{BackendState, backend_router, gateway_router};
use crate::server::{BoundServer, MutualTlsServer, ServerTlsConfig};
use crate::trust::TrustedProxyAuthenticator;
use crate::{Error, Result};

/// Pair name of each service's server certificate.
pub const SERVER_PAIR_NAME: &str = "tls";

/// A fully initialised service, ready to bind.
pub struct Service {
    name: &'static str,
    server: MutualTlsServer,
    router: Router,
}

impl Service {
    /// Service name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured listen address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.server.bind_addr()
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(self) -> Result<BoundService> {
        let server = self.server.bind().await?;
        info!(service = self.name, addr = %server.local_addr(), "Bound");
        Ok(BoundService {
            name: self.name,
            server,
            router: self.router,
        })
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// A service whose socket is bound.
pub struct BoundService {
    name: &'static str,
    server: BoundServer,
    router: Router,
}

impl BoundService {
    /// Actual listen address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server stops abnormally.
    pub async fn serve(self) -> Result<()> {
        info!(service = self.name, "Serving");
        self.server.serve(self.router).await
    }
}

/// Initialise the gateway.
///
/// 1. init the gateway CA; issue and persist its server pair and client pairs
/// 2. init the request-header CA; issue and persist the gateway's delegated
///    client pair from it
/// 3. when `send_proxy` is set, load the backend CA and build the forwarder
/// 4. trust the gateway CA for client certificates
///
/// # Errors
///
/// Returns the first PKI, persistence or TLS error.
pub fn gateway(config: &Config, send_proxy: bool) -> Result<Service> {
    let gw = &config.gateway;
    let dir = &config.store.dir;

    let mut store = CertStore::new(dir, config.pki)?;
    store.init_ca(&gw.ca_name)?;
    let server_paths = issue_server_pair(&mut store, &gw.server_alt_names())?;
    issue_client_pairs(&mut store, &gw.client_identities)?;

    let mut rh_store = CertStore::new(dir, config.pki)?;
    rh_store.init_ca(&config.request_header.ca_name)?;
    let proxy_pair = rh_store.new_client_cert_pair(&AltNames::dns(gw.proxy_identity.as_str()))?;
    rh_store.write_pair(&gw.proxy_identity, &proxy_pair)?;

    let forwarder = if send_proxy {
        let mut backend_store = CertStore::new(dir, config.pki)?;
        backend_store.load_ca(&gw.backend_ca)?;
        let forwarder = ProxyForwarder::new(ForwarderConfig {
            backend_url: gw.backend_url.clone(),
            client_cert_pem: proxy_pair.cert_pem,
            client_key_pem: proxy_pair.key_pem,
            backend_ca_pem: backend_store.ca_cert_bytes()?,
            timeout: gw.forward_timeout,
            pool_size: gw.pool_size,
            username_header: config.request_header.username_header.clone(),
        })?;
        info!(backend = %gw.backend_url, "Forwarding /database to backend");
        Some(forwarder)
    } else {
        None
    };

    let server = MutualTlsServer::new(&ServerTlsConfig {
        bind: gw.bind,
        cert_file: server_paths.cert,
        key_file: server_paths.key,
        client_ca_files: vec![store.cert_file(CA_PAIR_NAME)],
    })?;

    info!(ca = %gw.ca_name, send_proxy, "Gateway initialised");
    Ok(Service {
        name: "gateway",
        server,
        router: gateway_router(forwarder),
    })
}

/// Initialise the backend.
///
/// 1. init the backend CA; issue and persist its server pair and client pairs
/// 2. when `receive_proxy` is set, load the gateway and request-header CAs;
///    the latter decides whose forwarded identity is honoured
/// 3. trust the backend CA, plus the loaded peer CAs, for client certificates
///
/// # Errors
///
/// Returns the first PKI, persistence or TLS error.  With `receive_proxy`,
/// [`Error::NotFound`] if the gateway has not created its CAs yet.
pub fn backend(config: &Config, receive_proxy: bool) -> Result<Service> {
    let be = &config.backend;
    let dir = &config.store.dir;

    let mut store = CertStore::new(dir, config.pki)?;
    store.init_ca(&be.ca_name)?;
    let server_paths = issue_server_pair(&mut store, &be.server_alt_names())?;
    issue_client_pairs(&mut store, &be.client_identities)?;

    let mut client_ca_files: Vec<PathBuf> = vec![store.cert_file(CA_PAIR_NAME)];

    let authenticator = if receive_proxy {
        let mut gw_store = CertStore::new(dir, config.pki)?;
        gw_store.load_ca(&be.gateway_ca)?;
        client_ca_files.push(gw_store.cert_file(CA_PAIR_NAME));

        let mut rh_store = CertStore::new(dir, config.pki)?;
        rh_store.load_ca(&config.request_header.ca_name)?;
        client_ca_files.push(rh_store.cert_file(CA_PAIR_NAME));

        let pool = TrustPool::from_pem(&rh_store.ca_cert_bytes()?)?;
        info!(
            request_header_ca = %config.request_header.ca_name,
            "Honouring forwarded identities from request-header proxies"
        );
        TrustedProxyAuthenticator::new(pool)
    } else {
        TrustedProxyAuthenticator::without_proxy()
    };

    let username_header = HeaderName::try_from(config.request_header.username_header.as_str())
        .map_err(|e| Error::Config(format!("Invalid username header: {e}")))?;

    let server = MutualTlsServer::new(&ServerTlsConfig {
        bind: be.bind,
        cert_file: server_paths.cert,
        key_file: server_paths.key,
        client_ca_files,
    })?;

    info!(ca = %be.ca_name, receive_proxy, "Backend initialised");
    Ok(Service {
        name: "backend",
        server,
        router: backend_router(BackendState::new(authenticator, username_header)),
    })
}

fn issue_server_pair(store: &mut CertStore, alt_names: &AltNames) -> Result<PairPaths> {
    let pair = store.new_server_cert_pair(alt_names)?;
    store.write_pair(SERVER_PAIR_NAME, &pair)
}

fn issue_client_pairs(store: &mut CertStore, identities: &[String]) -> Result<()> {
    for identity in identities {
        let pair = store.new_client_cert_pair(&AltNames::dns(identity.as_str()))?;
        store.write_pair(identity, &pair)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{KeyRole, load_certs};

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.store.dir = dir.to_path_buf();
        config.gateway.bind = "127.0.0.1:0".parse().unwrap();
        config.backend.bind = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[test]
    fn gateway_writes_prefixed_material() {
        let dir = tempfile::tempdir().unwrap();
        gateway(&config(dir.path()), false).unwrap();

        for file in [
            "apiserver-ca.crt",
            "apiserver-ca.key",
            "apiserver-tls.crt",
            "apiserver-rudro.crt",
            "requestheader-ca.crt",
            "requestheader-apiserver.rudro.crt",
            "requestheader-apiserver.rudro.key",
        ] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }
    }

    #[test]
    fn delegated_pair_is_signed_by_request_header_ca() {
        // GIVEN: an initialised gateway
        let dir = tempfile::tempdir().unwrap();
        gateway(&config(dir.path()), false).unwrap();

        // WHEN: verifying its delegated pair against each CA
        let proxy = load_certs(&dir.path().join("requestheader-apiserver.rudro.crt")).unwrap();
        let rh = TrustPool::from_der(load_certs(&dir.path().join("requestheader-ca.crt")).unwrap()).unwrap();
        let api = TrustPool::from_der(load_certs(&dir.path().join("apiserver-ca.crt")).unwrap()).unwrap();

        // THEN: only the request-header CA accepts it
        assert!(rh.verify(&proxy, KeyRole::Client).is_ok());
        assert!(api.verify(&proxy, KeyRole::Client).is_err());
    }

    #[test]
    fn send_proxy_without_backend_ca_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = gateway(&config(dir.path()), true);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn receive_proxy_without_gateway_cas_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = backend(&config(dir.path()), true);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn restart_keeps_ca_material() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        backend(&cfg, false).unwrap();
        let before = std::fs::read(dir.path().join("database-ca.key")).unwrap();

        backend(&cfg, false).unwrap();

        let after = std::fs::read(dir.path().join("database-ca.key")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn full_bootstrap_order_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        gateway(&cfg, false).unwrap();
        backend(&cfg, true).unwrap();
        gateway(&cfg, true).unwrap();
    }
}
