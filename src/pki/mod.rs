//! Certificate authority lifecycle.
//!
//! ```text
//! CertStore ──init_ca/load_ca──▶ CertificateAuthority ──issue──▶ IssuedPair
//!     │                                  │
//!     └── write / cert_file / key_file   └── cert_der ──▶ TrustPool::verify
//! ```
//!
//! - [`authority`]: self-signed CAs and leaf issuance (`rcgen`)
//! - [`store`]: directory-backed registry with deterministic paths
//! - [`pool`]: chain verification against a set of anchors (`rustls-webpki`)
//! - [`pem`]: PEM parsing and file loading (`rustls-pemfile`)

pub mod authority;
pub mod pem;
pub mod pool;
pub mod store;

pub use authority::{AltNames, CertificateAuthority, IssuedPair, KeyRole};
pub use pem::{load_certs, load_private_key};
pub use pool::TrustPool;
pub use store::{CA_PAIR_NAME, CertStore, PairPaths};
