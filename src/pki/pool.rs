//! Verification pools of trusted CA certificates.
//!
//! A [`TrustPool`] answers one question: does this certificate chain lead to
//! one of my anchors, for this key usage, right now?  Validation is full
//! X.509 path building via `rustls-webpki`: signatures, validity windows,
//! basic constraints and extended key usage.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, TrustAnchor, UnixTime};
use webpki::{EndEntityCert, KeyUsage, anchor_from_trusted_cert};

use super::KeyRole;
use crate::{Error, Result};

/// A set of trusted CA certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustPool {
    certs: Vec<CertificateDer<'static>>,
    anchors: Vec<TrustAnchor<'static>>,
}

impl TrustPool {
    /// Empty pool; verifies nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool holding every certificate in a PEM buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM is malformed or a certificate is not a
    /// usable trust anchor.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut pool = Self::new();
        pool.add_pem(pem)?;
        Ok(pool)
    }

    /// Pool holding the given DER certificates.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate is not a usable trust anchor.
    pub fn from_der(certs: impl IntoIterator<Item = CertificateDer<'static>>) -> Result<Self> {
        let mut pool = Self::new();
        for cert in certs {
            pool.add_der(cert)?;
        }
        Ok(pool)
    }

    /// Add every certificate in a PEM buffer.
    ///
    /// # Errors
    ///
    /// See [`TrustPool::from_pem`].
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<()> {
        for cert in super::pem::parse_certs(pem, "trust pool")? {
            self.add_der(cert)?;
        }
        Ok(())
    }

    /// Add one DER certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be parsed as a trust anchor.
    pub fn add_der(&mut self, cert: CertificateDer<'static>) -> Result<()> {
        let anchor = anchor_from_trusted_cert(&cert)
            .map_err(|e| Error::Pki(format!("Failed to parse trust anchor: {e:?}")))?
            .to_owned();
        self.anchors.push(anchor);
        self.certs.push(cert);
        Ok(())
    }

    /// Number of anchors in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether the pool holds no anchors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// The pool as a rustls root store, for TLS client/server verifiers.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects one of the anchors.
    pub fn root_store(&self) -> Result<Arc<RootCertStore>> {
        let mut roots = RootCertStore::empty();
        for cert in &self.certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;
        }
        Ok(Arc::new(roots))
    }

    /// Verify `chain` (end-entity first, then intermediates) for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pki`] if the chain is empty, unparsable, or does not
    /// validate against any anchor for the requested key usage.
    pub fn verify(&self, chain: &[CertificateDer<'_>], role: KeyRole) -> Result<()> {
        self.verify_at(chain, role, UnixTime::now())
    }

    /// [`TrustPool::verify`] at an explicit point in time.
    ///
    /// # Errors
    ///
    /// See [`TrustPool::verify`].
    pub fn verify_at(
        &self,
        chain: &[CertificateDer<'_>],
        role: KeyRole,
        now: UnixTime,
    ) -> Result<()> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or_else(|| Error::Pki("Empty certificate chain".to_string()))?;

        let ee = EndEntityCert::try_from(end_entity)
            .map_err(|e| Error::Pki(format!("Failed to parse end-entity certificate: {e:?}")))?;

        let usage = match role {
            KeyRole::Server => KeyUsage::server_auth(),
            KeyRole::Client => KeyUsage::client_auth(),
        };

        ee.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &self.anchors,
            intermediates,
            now,
            usage,
            None,
            None,
        )
        .map_err(|e| Error::Pki(format!("Certificate chain verification failed: {e:?}")))?;

        Ok(())
    }
}
