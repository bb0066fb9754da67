//! Certificate authorities and leaf issuance.
//!
//! A [`CertificateAuthority`] is a self-signed signing identity whose subject
//! and issuer are both `CN=<name>`.  It issues [`IssuedPair`]s: leaf
//! certificates carrying exactly one extended key usage ([`KeyRole`]) and the
//! subject alternative names supplied by the caller ([`AltNames`]).
//!
//! # Identity convention
//!
//! The subject Common Name of every leaf is derived from its SANs: the first
//! DNS name, or failing that the first IP address.  Client certificates that
//! stand for a caller therefore carry that caller's identity as their first
//! DNS name, and [`crate::trust`] reads it back from the Common Name.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::{Error, Result};

const SECONDS_PER_DAY: i64 = 86_400;

// ─────────────────────────────────────────────────────────────────────────────
// Issuance parameters
// ─────────────────────────────────────────────────────────────────────────────

/// Extended key usage a leaf certificate is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    /// `id-kp-serverAuth`
    Server,
    /// `id-kp-clientAuth`
    Client,
}

impl KeyRole {
    fn purpose(self) -> ExtendedKeyUsagePurpose {
        match self {
            Self::Server => ExtendedKeyUsagePurpose::ServerAuth,
            Self::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Subject alternative names for a leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AltNames {
    /// IP address SANs.
    pub ip_addresses: Vec<IpAddr>,
    /// DNS name SANs.  The first entry becomes the subject Common Name.
    pub dns_names: Vec<String>,
}

impl AltNames {
    /// SANs consisting of a single DNS name.
    #[must_use]
    pub fn dns(name: impl Into<String>) -> Self {
        Self {
            ip_addresses: Vec::new(),
            dns_names: vec![name.into()],
        }
    }

    /// SANs consisting of a single IP address.
    #[must_use]
    pub fn ip(addr: IpAddr) -> Self {
        Self {
            ip_addresses: vec![addr],
            dns_names: Vec::new(),
        }
    }

    /// Returns `true` when no SAN of any kind is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ip_addresses.is_empty() && self.dns_names.is_empty()
    }

    /// Common Name a leaf with these SANs is issued under.
    ///
    /// First DNS name, else the first IP address, else `None`.
    #[must_use]
    pub fn common_name(&self) -> Option<String> {
        self.dns_names
            .first()
            .cloned()
            .or_else(|| self.ip_addresses.first().map(ToString::to_string))
    }

    fn to_san_types(&self) -> Result<Vec<SanType>> {
        let mut sans = Vec::with_capacity(self.ip_addresses.len() + self.dns_names.len());
        for dns in &self.dns_names {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Pki(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        sans.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        Ok(sans)
    }
}

/// A freshly issued leaf certificate and its private key, PEM encoded.
#[derive(Debug, Clone)]
pub struct IssuedPair {
    /// Subject Common Name of the leaf.
    pub common_name: String,
    /// Extended key usage the leaf was issued for.
    pub role: KeyRole,
    /// SANs copied into the leaf.
    pub alt_names: AltNames,
    /// Name of the issuing authority.
    pub issuer: String,
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: String,
    der: CertificateDer<'static>,
}

impl IssuedPair {
    /// DER encoding of the leaf certificate.
    #[must_use]
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.der
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate authority
// ─────────────────────────────────────────────────────────────────────────────

/// A self-signed CA: name, certificate and (optionally) its signing key.
///
/// Authorities loaded only to verify peers carry no key and cannot issue.
#[derive(Clone)]
pub struct CertificateAuthority {
    name: String,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: Option<String>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("name", &self.name)
            .field("can_sign", &self.can_sign())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a new key pair and self-signed CA certificate for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn generate(name: &str, validity_days: u32) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Pki(format!("Failed to generate CA key for '{name}': {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = offset_from_now(0)?;
        params.not_after = offset_from_now(validity_days)?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Pki(format!("CA cert generation failed for '{name}': {e}")))?;

        debug!(ca = %name, validity_days, "Generated self-signed CA");

        Ok(Self {
            name: name.to_owned(),
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_pem: Some(key_pair.serialize_pem()),
        })
    }

    /// Rebuild an authority from its PEM certificate and optional PEM key.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate is not valid PEM, or if a key is
    /// supplied that cannot be parsed.
    pub fn from_pem(name: &str, cert_pem: &str, key_pem: Option<&str>) -> Result<Self> {
        let cert_der = super::pem::parse_certs(cert_pem.as_bytes(), name)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Pki(format!("No certificate in CA material for '{name}'")))?;

        if let Some(key) = key_pem {
            KeyPair::from_pem(key)
                .map_err(|e| Error::Pki(format!("Failed to parse CA key for '{name}': {e}")))?;
        }

        Ok(Self {
            name: name.to_owned(),
            cert_pem: cert_pem.to_owned(),
            cert_der,
            key_pem: key_pem.map(str::to_owned),
        })
    }

    /// Authority name (also its subject and issuer Common Name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PEM-encoded CA certificate.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded CA certificate.
    #[must_use]
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM-encoded signing key, if this authority was loaded with one.
    #[must_use]
    pub fn key_pem(&self) -> Option<&str> {
        self.key_pem.as_deref()
    }

    /// Whether this authority holds its signing key.
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.key_pem.is_some()
    }

    /// Issue a leaf certificate for `role` with the given SANs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSigningKey`] for verify-only authorities, and
    /// [`Error::Pki`] if `alt_names` is empty, a DNS name is not valid IA5,
    /// or signing fails.
    pub fn issue(
        &self,
        role: KeyRole,
        alt_names: &AltNames,
        validity_days: u32,
    ) -> Result<IssuedPair> {
        let ca_key_pem = self
            .key_pem
            .as_deref()
            .ok_or_else(|| Error::MissingSigningKey(self.name.clone()))?;
        let common_name = alt_names.common_name().ok_or_else(|| {
            Error::Pki(format!(
                "Leaf certificate from '{}' needs at least one DNS name or IP address",
                self.name
            ))
        })?;

        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Pki(format!("Failed to parse CA key for '{}': {e}", self.name)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| Error::Pki(format!("Failed to parse CA cert for '{}': {e}", self.name)))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Pki(format!("Failed to generate leaf key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![role.purpose()];
        params.subject_alt_names = alt_names.to_san_types()?;
        params.use_authority_key_identifier_extension = true;
        params.not_before = offset_from_now(0)?;
        params.not_after = offset_from_now(validity_days)?;

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Pki(format!("Leaf cert signing failed: {e}")))?;

        debug!(ca = %self.name, cn = %common_name, %role, "Issued leaf certificate");

        Ok(IssuedPair {
            common_name,
            role,
            alt_names: alt_names.clone(),
            issuer: self.name.clone(),
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            der: cert.der().clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Current time plus `days`, as an `OffsetDateTime` for `rcgen`.
///
/// Goes through the Unix timestamp because `time` is built without its
/// `std` feature (no `now_utc`).
fn offset_from_now(days: u32) -> Result<OffsetDateTime> {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Pki(format!("System time error: {e}")))?
        .as_secs();
    let now_secs = i64::try_from(now_secs).unwrap_or(i64::MAX);
    let target = now_secs.saturating_add(i64::from(days) * SECONDS_PER_DAY);

    OffsetDateTime::from_unix_timestamp(target)
        .map_err(|e| Error::Pki(format!("Date calculation error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CertIdentity;
    use crate::pki::TrustPool;
    use std::net::Ipv4Addr;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn ca(name: &str) -> CertificateAuthority {
        CertificateAuthority::generate(name, 3650).unwrap()
    }

    #[test]
    fn generated_ca_is_self_signed_under_its_name() {
        // GIVEN: a freshly generated authority
        let ca = ca("apiserver");
        // WHEN: parsing its certificate
        let (_, cert) = X509Certificate::from_der(ca.cert_der()).unwrap();
        // THEN: subject == issuer == CN=apiserver, marked as CA
        assert_eq!(cert.subject().to_string(), "CN=apiserver");
        assert_eq!(cert.issuer(), cert.subject());
        assert!(cert.is_ca());
        assert!(ca.can_sign());
    }

    #[test]
    fn generate_produces_distinct_keys() {
        let a = ca("ca");
        let b = ca("ca");
        assert_ne!(a.key_pem(), b.key_pem());
    }

    #[test]
    fn leaf_issuer_matches_ca_subject() {
        let ca = ca("database");
        let leaf = ca
            .issue(KeyRole::Client, &AltNames::dns("deb"), 365)
            .unwrap();

        let (_, ca_cert) = X509Certificate::from_der(ca.cert_der()).unwrap();
        let (_, leaf_cert) = X509Certificate::from_der(leaf.cert_der()).unwrap();
        assert_eq!(leaf_cert.issuer(), ca_cert.subject());
        assert_eq!(leaf.issuer, "database");
        assert!(!leaf_cert.is_ca());
    }

    #[test]
    fn common_name_is_first_dns_name() {
        // GIVEN: SANs with two DNS names and an IP
        let alt = AltNames {
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            dns_names: vec!["rudro".into(), "rudro.internal".into()],
        };
        let leaf = ca("apiserver").issue(KeyRole::Client, &alt, 30).unwrap();
        // THEN: CN is the first DNS name, every SAN copied verbatim
        let id = CertIdentity::from_der(leaf.cert_der()).unwrap();
        assert_eq!(id.common_name.as_deref(), Some("rudro"));
        assert_eq!(id.san_dns_names, vec!["rudro", "rudro.internal"]);
        assert_eq!(id.san_ip_addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }

    #[test]
    fn common_name_falls_back_to_first_ip() {
        let alt = AltNames::ip("127.0.0.2".parse().unwrap());
        let leaf = ca("database").issue(KeyRole::Server, &alt, 30).unwrap();
        assert_eq!(leaf.common_name, "127.0.0.2");
    }

    #[test]
    fn leaf_carries_only_the_requested_extended_key_usage() {
        let leaf = ca("ca")
            .issue(KeyRole::Server, &AltNames::dns("svc.local"), 30)
            .unwrap();
        let (_, cert) = X509Certificate::from_der(leaf.cert_der()).unwrap();
        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);
        assert!(!eku.client_auth);
    }

    #[test]
    fn issue_rejects_empty_alt_names() {
        let result = ca("ca").issue(KeyRole::Client, &AltNames::default(), 30);
        assert!(matches!(result, Err(Error::Pki(_))));
    }

    #[test]
    fn verify_only_authority_cannot_issue() {
        // GIVEN: an authority rebuilt from its certificate alone
        let full = ca("requestheader");
        let verify_only =
            CertificateAuthority::from_pem("requestheader", full.cert_pem(), None).unwrap();
        // WHEN: issuing
        let result = verify_only.issue(KeyRole::Client, &AltNames::dns("x"), 30);
        // THEN: missing key error names the authority
        assert!(matches!(result, Err(Error::MissingSigningKey(name)) if name == "requestheader"));
    }

    #[test]
    fn authority_rebuilt_from_pem_keeps_signing_identity() {
        let original = ca("apiserver");
        let rebuilt =
            CertificateAuthority::from_pem("apiserver", original.cert_pem(), original.key_pem())
                .unwrap();
        assert_eq!(rebuilt.cert_der(), original.cert_der());

        let leaf = rebuilt
            .issue(KeyRole::Client, &AltNames::dns("rudro"), 30)
            .unwrap();
        let pool = TrustPool::from_der([original.cert_der().clone()]).unwrap();
        assert!(pool.verify(&[leaf.cert_der().clone()], KeyRole::Client).is_ok());
    }

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(CertificateAuthority::from_pem("ca", "not pem", None).is_err());
    }

    #[test]
    fn invalid_dns_san_is_rejected() {
        let result = ca("ca").issue(KeyRole::Client, &AltNames::dns("bad\u{e9}name"), 30);
        assert!(result.is_err());
    }
}
