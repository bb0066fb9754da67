//! Command-line interface

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::pki::KeyRole;

/// Gateway and backend joined by a mutual-TLS chain of trust
#[derive(Parser, Debug)]
#[command(name = "trustgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TRUSTGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Certificate store directory (overrides `store.dir`)
    #[arg(long, env = "TRUSTGATE_STORE_DIR", global = true)]
    pub store_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TRUSTGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TRUSTGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the front gateway
    Gateway {
        /// Forward /database/{resource} to the backend
        #[arg(long)]
        send_proxy_request: bool,

        /// Listen address (overrides `gateway.bind`)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Run the backend
    Backend {
        /// Honour forwarded identities from request-header proxies
        #[arg(long)]
        receive_proxy_request: bool,

        /// Listen address (overrides `backend.bind`)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Certificate store management
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Certificate store subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Create a CA, or load it if it already exists
    InitCa {
        /// CA name
        #[arg(required = true)]
        name: String,
    },

    /// Issue and persist a leaf pair from an existing CA
    Issue {
        /// Issuing CA
        #[arg(long)]
        ca: String,

        /// Key usage
        #[arg(long, value_enum, default_value_t = KeyRole::Client)]
        role: KeyRole,

        /// DNS SANs; the first becomes the Common Name
        #[arg(long = "dns")]
        dns_names: Vec<String>,

        /// IP SANs
        #[arg(long = "ip")]
        ip_addresses: Vec<IpAddr>,

        /// Pair name
        #[arg(required = true)]
        name: String,
    },

    /// Print a CA certificate (PEM)
    Show {
        /// CA name
        #[arg(required = true)]
        name: String,
    },
}
