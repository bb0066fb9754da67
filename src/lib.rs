//! trustgate library
//!
//! Chain of trust between an HTTPS gateway and a backend service.
//!
//! # Features
//!
//! - **Certificate store**: named, file-backed CAs issuing server and client
//!   leaves, with deterministic on-disk paths
//! - **Mutual TLS**: client certificates requested but optional, verified
//!   against the configured CAs when presented
//! - **Request-header authentication**: a forwarded identity header honoured
//!   only from proxies holding a certificate of a dedicated CA
//! - **Delegation**: the gateway forwards to the backend under its own
//!   certificate, carrying the caller's identity in the header
//!
//! # Layout
//!
//! ```text
//! pki ─────▶ server ──▶ routes ◀── trust
//!  │                      ▲
//!  └──────▶ proxy ────────┘          startup ties them together
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod pki;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod startup;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG`, when set, takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
