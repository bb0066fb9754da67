//! Request-header authentication: whose identity does a backend honour?
//!
//! The backend sees a TLS connection (with or without a peer certificate)
//! and possibly a forwarded-identity header.  [`TrustedProxyAuthenticator`]
//! turns those into a [`TrustDecision`]:
//!
//! ```text
//! no peer certificate                     → system:anonymous   (Anonymous)
//! peer chains to request-header CA        → header value       (ForwardedHeader)
//! any other peer certificate              → certificate CN     (ClientCertificateCN)
//! ```
//!
//! The header is trusted **only** when the connection itself is
//! authenticated by a certificate from the request-header CA with the
//! `clientAuth` usage.  A non-proxy certificate's header, forged or not, has
//! no effect, and neither does a header on an unauthenticated connection.

use std::fmt;

use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::identity::CertIdentity;
use crate::pki::{KeyRole, TrustPool};

/// Identity assigned to callers that cannot be authenticated.
pub const ANONYMOUS_USER: &str = "system:anonymous";

/// Default forwarded-identity header.
pub const DEFAULT_USERNAME_HEADER: &str = "X-Remote-User";

/// Where a resolved identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Subject CN of a directly connected client certificate.
    ClientCertificateCN,
    /// Forwarded-identity header asserted by a verified proxy.
    ForwardedHeader,
    /// No usable identity.
    Anonymous,
}

impl IdentitySource {
    /// Short label used in logs and responses.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ClientCertificateCN => "Client-Cert-CN",
            Self::ForwardedHeader => "X-Remote-User",
            Self::Anonymous => "-",
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-request outcome of the trust decision.  Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDecision {
    /// Resolved caller identity.
    pub identity: String,
    /// Which input the identity was taken from.
    pub source: IdentitySource,
}

impl TrustDecision {
    /// The anonymous decision.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identity: ANONYMOUS_USER.to_owned(),
            source: IdentitySource::Anonymous,
        }
    }

    fn forwarded(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            source: IdentitySource::ForwardedHeader,
        }
    }

    fn client_cn(identity: String) -> Self {
        Self {
            identity,
            source: IdentitySource::ClientCertificateCN,
        }
    }
}

impl fmt::Display for TrustDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identity, self.source)
    }
}

/// Backend-side decision procedure for request-header authentication.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyAuthenticator {
    request_header_pool: Option<TrustPool>,
}

impl TrustedProxyAuthenticator {
    /// Authenticator trusting proxies whose certificates chain to `pool`.
    ///
    /// An empty pool trusts no proxy.
    #[must_use]
    pub fn new(pool: TrustPool) -> Self {
        Self {
            request_header_pool: (!pool.is_empty()).then_some(pool),
        }
    }

    /// Authenticator with no request-header CA: every certificate is taken
    /// at its own Common Name.
    #[must_use]
    pub fn without_proxy() -> Self {
        Self::default()
    }

    /// Whether a request-header CA is configured.
    #[must_use]
    pub fn accepts_proxies(&self) -> bool {
        self.request_header_pool.is_some()
    }

    /// Resolve the caller identity for one request.
    ///
    /// `peer_certs` is the chain presented on the TLS connection (leaf
    /// first), `forwarded` the value of the forwarded-identity header.
    #[must_use]
    pub fn authenticate(
        &self,
        peer_certs: &[CertificateDer<'_>],
        forwarded: Option<&str>,
    ) -> TrustDecision {
        let Some(leaf) = peer_certs.first() else {
            return TrustDecision::anonymous();
        };

        if self.is_trusted_proxy(peer_certs) {
            return match forwarded.map(str::trim).filter(|v| !v.is_empty()) {
                Some(user) => TrustDecision::forwarded(user),
                None => {
                    debug!("Trusted proxy forwarded no identity");
                    TrustDecision::anonymous()
                }
            };
        }

        match CertIdentity::common_name_of(leaf) {
            Some(cn) => TrustDecision::client_cn(cn),
            None => {
                debug!("Client certificate carries no usable Common Name");
                TrustDecision::anonymous()
            }
        }
    }

    fn is_trusted_proxy(&self, chain: &[CertificateDer<'_>]) -> bool {
        let Some(pool) = &self.request_header_pool else {
            return false;
        };
        match pool.verify(chain, KeyRole::Client) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Peer is not a request-header proxy");
                false
            }
        }
    }
}
