//! Frozen runtime settings
//!
//! Configuration arrives as one immutable value. The ambient loader reads an
//! optional TOML file; every field has a default so an empty file (or no file
//! at all) yields a working development setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Docker network to watch for containers
    #[serde(default = "default_network")]
    pub network: String,

    /// Base domain for auto-generated hostnames
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// HTTP port for the HTTPS redirector (0 disables it)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port for the proxy
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Directory holding the CA and server certificates
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,

    /// Generate certificates at startup if not present
    #[serde(default = "default_auto_cert")]
    pub auto_cert: bool,

    /// Hostname reserved for the dashboard; empty derives `roji.<base_domain>`
    #[serde(default)]
    pub dashboard_host: String,

    /// Log level directive (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_network() -> String {
    "roji".to_string()
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("/certs")
}

fn default_auto_cert() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: default_network(),
            base_domain: default_base_domain(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            certs_dir: default_certs_dir(),
            auto_cert: default_auto_cert(),
            dashboard_host: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    /// The dashboard hostname, derived from the base domain when unset.
    pub fn dashboard_host(&self) -> String {
        if self.dashboard_host.is_empty() {
            format!("roji.{}", self.base_domain)
        } else {
            self.dashboard_host.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.network, "roji");
        assert_eq!(settings.base_domain, "localhost");
        assert_eq!(settings.http_port, 80);
        assert_eq!(settings.https_port, 443);
        assert_eq!(settings.certs_dir, PathBuf::from("/certs"));
        assert!(settings.auto_cert);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.network, "roji");
        assert!(settings.auto_cert);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let settings: Settings = toml::from_str(
            r#"
            network = "shared"
            base_domain = "dev.localhost"
            https_port = 8443
            auto_cert = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.network, "shared");
        assert_eq!(settings.base_domain, "dev.localhost");
        assert_eq!(settings.https_port, 8443);
        assert!(!settings.auto_cert);
        // untouched fields keep defaults
        assert_eq!(settings.http_port, 80);
    }

    #[test]
    fn test_dashboard_host_derivation() {
        let mut settings = Settings::default();
        settings.base_domain = "dev.localhost".to_string();
        assert_eq!(settings.dashboard_host(), "roji.dev.localhost");

        settings.dashboard_host = "panel.dev.localhost".to_string();
        assert_eq!(settings.dashboard_host(), "panel.dev.localhost");
    }
}
