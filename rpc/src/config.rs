//! Runtime configuration.
//!
//! Loaded from a TOML file: listener list, negotiation settings, and
//! logging settings. Unknown fields are rejected so typos surface at load
//! time.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name used for thread names and log context.
    #[serde(default = "default_name")]
    pub name: String,

    /// Protocol listeners.
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,

    /// Negotiation settings.
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            listener: Vec::new(),
            negotiation: NegotiationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_name() -> String {
    "rpc".to_string()
}

/// One protocol listener.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub protocol: Protocol,
    pub address: SocketAddr,
}

/// Negotiation settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NegotiationConfig {
    /// Handshake deadline in milliseconds.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub timeout_ms: u64,
}

impl NegotiationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            timeout_ms: default_negotiation_timeout_ms(),
        }
    }
}

fn default_negotiation_timeout_ms() -> u64 {
    3000
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG when set).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in output.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default = "default_true")]
    pub target: bool,

    /// Include thread names.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.name, "rpc");
        assert!(config.listener.is_empty());
        assert_eq!(config.negotiation.timeout(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn listeners_parse_with_protocols() {
        let config: Config = toml::from_str(
            r#"
            name = "db"

            [[listener]]
            protocol = "yb"
            address = "127.0.0.1:7100"

            [[listener]]
            protocol = "redis"
            address = "127.0.0.1:6379"

            [[listener]]
            protocol = "cql"
            address = "127.0.0.1:9042"

            [negotiation]
            timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "db");
        assert_eq!(config.listener.len(), 3);
        assert_eq!(config.listener[0].protocol, Protocol::Yb);
        assert_eq!(config.listener[1].protocol, Protocol::Redis);
        assert_eq!(config.listener[2].protocol, Protocol::Cql);
        assert_eq!(config.negotiation.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("unknown_field = 1").is_err());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let result = toml::from_str::<Config>(
            r#"
            [[listener]]
            protocol = "http"
            address = "127.0.0.1:80"
            "#,
        );
        assert!(result.is_err());
    }
}
