//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields the trust
//! decision and the forwarder read: subject Common Name, issuer Common Name,
//! SAN DNS names and SAN IP addresses.

use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields of a peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name (CN).
    pub common_name: Option<String>,

    /// Issuer Common Name; the CA name for store-issued leaves.
    pub issuer_common_name: Option<String>,

    /// Subject Alternative Name: DNS entries.
    pub san_dns_names: Vec<String>,

    /// Subject Alternative Name: IP address entries.
    pub san_ip_addresses: Vec<IpAddr>,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Pki` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Pki(format!("Failed to parse peer certificate: {e}")))?;

        let (san_dns_names, san_ip_addresses) = extract_sans(&cert);

        Ok(Self {
            common_name: first_cn(cert.subject()),
            issuer_common_name: first_cn(cert.issuer()),
            san_dns_names,
            san_ip_addresses,
        })
    }

    /// Common Name of a DER certificate, or `None` if it cannot be parsed or
    /// carries no (non-empty) CN.
    #[must_use]
    pub fn common_name_of(der: &[u8]) -> Option<String> {
        Self::from_der(der)
            .ok()
            .and_then(|id| id.common_name)
            .filter(|cn| !cn.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn first_cn(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ips = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_octets(raw) {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    (dns_names, ips)
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, KeyPair};

    fn cert_without_cn() -> Vec<u8> {
        let mut params = CertificateParams::new(vec!["no-cn.local".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn from_der_reads_subject_and_issuer() {
        // GIVEN: a leaf issued by the "database" CA for "deb"
        let ca = crate::pki::CertificateAuthority::generate("database", 30).unwrap();
        let leaf = ca
            .issue(crate::pki::KeyRole::Client, &crate::pki::AltNames::dns("deb"), 30)
            .unwrap();
        // WHEN: parsing
        let id = CertIdentity::from_der(leaf.cert_der()).unwrap();
        // THEN: CN and issuer CN extracted
        assert_eq!(id.common_name.as_deref(), Some("deb"));
        assert_eq!(id.issuer_common_name.as_deref(), Some("database"));
        assert_eq!(id.san_dns_names, vec!["deb"]);
        assert!(id.san_ip_addresses.is_empty());
    }

    #[test]
    fn ipv6_san_is_decoded() {
        let ca = crate::pki::CertificateAuthority::generate("ca", 30).unwrap();
        let alt = crate::pki::AltNames::ip("::1".parse().unwrap());
        let leaf = ca.issue(crate::pki::KeyRole::Server, &alt, 30).unwrap();

        let id = CertIdentity::from_der(leaf.cert_der()).unwrap();
        assert_eq!(id.san_ip_addresses, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn missing_cn_is_none() {
        let der = cert_without_cn();
        assert!(CertIdentity::from_der(&der).unwrap().common_name.is_none());
        assert!(CertIdentity::common_name_of(&der).is_none());
    }

    #[test]
    fn invalid_bytes_return_error() {
        assert!(CertIdentity::from_der(b"not a cert").is_err());
        assert!(CertIdentity::common_name_of(b"not a cert").is_none());
    }

    #[test]
    fn ip_octets_of_unexpected_length_are_skipped() {
        assert!(ip_from_octets(&[1, 2, 3]).is_none());
        assert_eq!(ip_from_octets(&[127, 0, 0, 1]), Some("127.0.0.1".parse().unwrap()));
    }
}
