//! PEM loading for certificates and private keys.
//!
//! All certificate and key material handled by the store is **PEM**.  The
//! `parse_*` functions work on bytes already in memory; the `load_*` functions
//! read a file first and report the path in their errors.

use std::fs;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

/// Parse every certificate in a PEM buffer.
///
/// `source` names the buffer in error messages.
///
/// # Errors
///
/// Returns an error if a PEM block is malformed or no certificate is present.
pub fn parse_certs(pem: &[u8], source: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Pki(format!("Failed to parse certs from '{source}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Pki(format!("No certificates found in '{source}'")));
    }

    Ok(certs)
}

/// Parse the first private key in a PEM buffer (PKCS#8, RSA or SEC1).
///
/// # Errors
///
/// Returns an error if the buffer holds no private key.
pub fn parse_private_key(pem: &[u8], source: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Pki(format!("Failed to parse private key from '{source}': {e}")))?
        .ok_or_else(|| Error::Pki(format!("No private key found in '{source}'")))
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no certificate.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    parse_certs(&pem, &path.display().to_string())
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_file(path)?;
    parse_private_key(&pem, &path.display().to_string())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })
}
