//! Error types for trustgate

use std::io;

use thiserror::Error;

/// Result type alias for trustgate
pub type Result<T> = std::result::Result<T, Error>;

/// trustgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key or certificate generation, parsing or verification failure
    #[error("PKI error: {0}")]
    Pki(String),

    /// Certificate material is not present in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Issuance attempted before `init_ca` / `load_ca`
    #[error("No active certificate authority: call init_ca or load_ca first")]
    NoActiveAuthority,

    /// Authority was loaded for verification only and cannot sign
    #[error("Certificate authority '{0}' was loaded without its signing key")]
    MissingSigningKey(String),

    /// Pair name is reserved for CA material
    #[error("Name '{0}' is reserved for certificate authority material")]
    ReservedName(String),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport error on the forwarding path
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read() -> Result<Vec<u8>> {
            Ok(std::fs::read("/nonexistent/trustgate/database-ca.crt")?)
        }
        assert!(matches!(read(), Err(Error::Io(_))));
    }

    #[test]
    fn messages_name_the_offending_authority() {
        let msg = Error::MissingSigningKey("requestheader".into()).to_string();
        assert!(msg.contains("requestheader"));
    }
}
