//! Configuration management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::pki::AltNames;
use crate::trust::DEFAULT_USERNAME_HEADER;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Certificate store location
    pub store: StoreConfig,
    /// Certificate lifetimes
    pub pki: PkiConfig,
    /// Request-header authentication settings shared by both services
    pub request_header: RequestHeaderConfig,
    /// Front gateway service
    pub gateway: GatewayConfig,
    /// Backend service
    pub backend: BackendConfig,
}

/// Certificate store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every CA and issued pair
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("certs"),
        }
    }
}

/// Certificate lifetimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Lifetime of self-signed CAs, in days
    pub ca_validity_days: u32,
    /// Lifetime of issued leaves, in days
    pub leaf_validity_days: u32,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_validity_days: 3650,
            leaf_validity_days: 365,
        }
    }
}

/// Request-header authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHeaderConfig {
    /// Name of the CA that signs proxy client certificates
    pub ca_name: String,
    /// Header carrying the forwarded caller identity
    pub username_header: String,
}

impl Default for RequestHeaderConfig {
    fn default() -> Self {
        Self {
            ca_name: "requestheader".to_string(),
            username_header: DEFAULT_USERNAME_HEADER.to_string(),
        }
    }
}

/// Front gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Name of the gateway's own CA
    pub ca_name: String,
    /// IP SANs of the server certificate
    pub server_ips: Vec<IpAddr>,
    /// DNS SANs of the server certificate
    pub server_dns: Vec<String>,
    /// Client identities to issue pairs for at startup
    pub client_identities: Vec<String>,
    /// Common Name of the gateway's request-header client certificate
    pub proxy_identity: String,
    /// Base URL of the backend
    pub backend_url: String,
    /// Name of the backend's CA, trusted for the backend's server certificate
    pub backend_ca: String,
    /// Timeout of one forwarded call
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Duration,
    /// Maximum concurrent forwarded calls
    pub pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8443),
            ca_name: "apiserver".to_string(),
            server_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            server_dns: Vec::new(),
            client_identities: vec!["rudro".to_string()],
            proxy_identity: "apiserver.rudro".to_string(),
            backend_url: "https://127.0.0.2:8443".to_string(),
            backend_ca: "database".to_string(),
            forward_timeout: Duration::from_secs(20),
            pool_size: 10,
        }
    }
}

impl GatewayConfig {
    /// SANs of the gateway's server certificate
    #[must_use]
    pub fn server_alt_names(&self) -> AltNames {
        AltNames {
            ip_addresses: self.server_ips.clone(),
            dns_names: self.server_dns.clone(),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Name of the backend's own CA
    pub ca_name: String,
    /// IP SANs of the server certificate
    pub server_ips: Vec<IpAddr>,
    /// DNS SANs of the server certificate
    pub server_dns: Vec<String>,
    /// Client identities to issue pairs for at startup
    pub client_identities: Vec<String>,
    /// Name of the gateway's CA, trusted for client certificates when
    /// receiving proxied requests
    pub gateway_ca: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 8443),
            ca_name: "database".to_string(),
            server_ips: vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))],
            server_dns: Vec::new(),
            client_identities: vec!["deb".to_string()],
            gateway_ca: "apiserver".to_string(),
        }
    }
}

impl BackendConfig {
    /// SANs of the backend's server certificate
    #[must_use]
    pub fn server_alt_names(&self) -> AltNames {
        AltNames {
            ip_addresses: self.server_ips.clone(),
            dns_names: self.server_dns.clone(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TRUSTGATE_ prefix)
        figment = figment.merge(Env::prefixed("TRUSTGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let names = [
            &self.gateway.ca_name,
            &self.backend.ca_name,
            &self.request_header.ca_name,
        ];
        for (i, a) in names.iter().enumerate() {
            if a.is_empty() {
                return Err(Error::Config("CA names must not be empty".to_string()));
            }
            if names[i + 1..].contains(a) {
                return Err(Error::Config(format!(
                    "CA name '{a}' is used by more than one authority"
                )));
            }
        }
        if self.gateway.pool_size == 0 {
            return Err(Error::Config("gateway.pool_size must be at least 1".to_string()));
        }
        if self.request_header.username_header.is_empty() {
            return Err(Error::Config(
                "request_header.username_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_mirror_the_reference_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.gateway.bind.to_string(), "127.0.0.1:8443");
        assert_eq!(cfg.backend.bind.to_string(), "127.0.0.2:8443");
        assert_eq!(cfg.gateway.forward_timeout, Duration::from_secs(20));
        assert_eq!(cfg.gateway.pool_size, 10);
        assert_eq!(cfg.request_header.username_header, "X-Remote-User");
        assert_eq!(cfg.request_header.ca_name, "requestheader");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustgate.yaml");
        fs::write(
            &path,
            "store:\n  dir: /var/lib/trustgate\ngateway:\n  forward_timeout: 5s\n  pool_size: 2\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();

        assert_eq!(cfg.store.dir, PathBuf::from("/var/lib/trustgate"));
        assert_eq!(cfg.gateway.forward_timeout, Duration::from_secs(5));
        assert_eq!(cfg.gateway.pool_size, 2);
        // untouched sections keep their defaults
        assert_eq!(cfg.backend.ca_name, "database");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/trustgate.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn duplicate_ca_names_are_rejected() {
        let mut cfg = Config::default();
        cfg.backend.ca_name = "apiserver".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut cfg = Config::default();
        cfg.gateway.pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_alt_names_combine_ips_and_dns() {
        let mut gw = GatewayConfig::default();
        gw.server_dns = vec!["gateway.local".to_string()];
        let alt = gw.server_alt_names();
        assert_eq!(alt.common_name().as_deref(), Some("gateway.local"));
        assert_eq!(alt.ip_addresses.len(), 1);
    }

    #[test]
    fn pki_section_deserialises_from_yaml() {
        let pki: PkiConfig = serde_yaml::from_str("ca_validity_days: 30").unwrap();
        assert_eq!(pki.ca_validity_days, 30);
        assert_eq!(pki.leaf_validity_days, 365);
    }
}
