//! Gateway configuration: optional YAML file, then environment overrides

use aggregator_proxy::ForwarderConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Environment variable naming the YAML configuration file
pub const CONFIG_PATH_ENV: &str = "AGGREGATOR_CONFIG";

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
}

/// Request headers set by the authenticating front proxy
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityHeaders {
    pub user_headers: Vec<String>,
    pub group_headers: Vec<String>,
    pub extra_header_prefixes: Vec<String>,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            user_headers: vec!["X-Remote-User".to_string()],
            group_headers: vec!["X-Remote-Group".to_string()],
            extra_header_prefixes: vec!["X-Remote-Extra-".to_string()],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Plain HTTP listener; `None` disables it
    pub http_addr: Option<SocketAddr>,
    /// HTTPS listener, started only when `tls` is set
    pub https_addr: SocketAddr,
    pub tls: Option<TlsFiles>,
    pub connect_timeout_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    pub log_format: LogFormat,
    pub identity: IdentityHeaders,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            https_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            tls: None,
            connect_timeout_secs: 30,
            tls_handshake_timeout_secs: 10,
            log_format: LogFormat::Text,
            identity: IdentityHeaders::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from `AGGREGATOR_CONFIG` (if set) and apply `AGGREGATOR_*` overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let yaml = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read configuration file {}", path))?;
                Self::from_yaml(&yaml).with_context(|| format!("Invalid configuration file {}", path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Apply `AGGREGATOR_*` overrides read through `lookup`.
    ///
    /// An empty `AGGREGATOR_HTTP_ADDR` disables the plain HTTP listener.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("AGGREGATOR_HTTP_ADDR") {
            self.http_addr = if addr.is_empty() {
                None
            } else {
                Some(parse_addr("AGGREGATOR_HTTP_ADDR", &addr)?)
            };
        }
        if let Some(addr) = lookup("AGGREGATOR_HTTPS_ADDR") {
            self.https_addr = parse_addr("AGGREGATOR_HTTPS_ADDR", &addr)?;
        }

        match (lookup("AGGREGATOR_TLS_CERT"), lookup("AGGREGATOR_TLS_KEY")) {
            (Some(cert), Some(key)) => self.tls = Some(TlsFiles { cert, key }),
            (None, None) => {}
            _ => {
                return Err(anyhow!(
                    "AGGREGATOR_TLS_CERT and AGGREGATOR_TLS_KEY must be set together"
                ))
            }
        }

        if let Some(secs) = lookup("AGGREGATOR_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = secs
                .parse()
                .with_context(|| format!("Invalid AGGREGATOR_CONNECT_TIMEOUT_SECS: {}", secs))?;
        }
        if let Some(format) = lookup("AGGREGATOR_LOG_FORMAT") {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => return Err(anyhow!("Invalid AGGREGATOR_LOG_FORMAT: {}", other)),
            };
        }
        Ok(())
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            tls_handshake_timeout: Duration::from_secs(self.tls_handshake_timeout_secs),
            ..ForwarderConfig::default()
        }
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))
}
