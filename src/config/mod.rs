//! Configuration loading and validation
//!
//! The gateway is configured from a single TOML document. Server definitions
//! are immutable for the process lifetime; `validate()` runs after load and
//! rejects configurations the rest of the system assumes impossible (no
//! servers, a zero article size limit, half-configured TLS).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defaults matching the documented configuration surface
mod defaults {
    pub(super) fn host() -> String {
        "0.0.0.0".to_string()
    }

    pub(super) const fn port() -> u16 {
        80
    }

    pub(super) const fn idle_conn_expiry_secs() -> u64 {
        60
    }

    pub(super) fn default_newsgroup() -> String {
        "alt.binaries.misc".to_string()
    }

    /// 4 MiB article cap
    pub(super) const fn article_size_limit() -> usize {
        4 * 1024 * 1024
    }

    pub(super) const fn connections() -> u32 {
        50
    }
}

/// One upstream NNTP provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// `host:port` of the provider
    pub host: String,

    /// Credentials for AUTHINFO; authentication is skipped when `user` is unset
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,

    /// Connect with TLS
    #[serde(default)]
    pub tls: bool,

    /// May this upstream accept POST
    #[serde(default)]
    pub posting: bool,

    /// Hard cap on concurrent sessions to this upstream
    #[serde(default = "defaults::connections")]
    pub connections: u32,
}

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP listen address
    #[serde(default = "defaults::host")]
    pub host: String,

    /// HTTP listen port
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Upstream NNTP providers; at least one required
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Idle pooled connections older than this are purged
    #[serde(default = "defaults::idle_conn_expiry_secs")]
    pub idle_conn_expiry_secs: u64,

    /// Newsgroups header fallback for POSTs that carry none
    #[serde(default = "defaults::default_newsgroup")]
    pub default_newsgroup: String,

    /// Upper bound in bytes on any article body, both directions
    #[serde(default = "defaults::article_size_limit")]
    pub article_size_limit: usize,

    /// PEM certificate chain; HTTPS is enabled when both this and
    /// `key_file` are set
    #[serde(default)]
    pub cert_file: Option<String>,

    /// PEM private key
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Config {
    /// Idle expiry as a [`Duration`]
    #[must_use]
    pub fn idle_conn_expiry(&self) -> Duration {
        Duration::from_secs(self.idle_conn_expiry_secs)
    }

    /// True when both TLS files are configured
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// Validate invariants the rest of the system depends on
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("no NNTP servers configured");
        }
        for server in &self.servers {
            if server.host.is_empty() {
                anyhow::bail!("server host cannot be empty");
            }
            if !server.host.contains(':') {
                anyhow::bail!("server host '{}' must be host:port", server.host);
            }
            if server.connections == 0 {
                anyhow::bail!("server '{}' has a zero connection cap", server.host);
            }
        }
        if self.article_size_limit == 0 {
            anyhow::bail!("article_size_limit cannot be zero");
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            anyhow::bail!("cert_file and key_file must be set together");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file and validate it
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{path}'"))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file '{path}'"))?;
    config.validate()?;
    Ok(config)
}
