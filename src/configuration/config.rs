use super::types::*;
use crate::error_handling::types::ConfigError;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MAX_SNIFF_BYTES: usize = 64 * 1024;

fn default_sniff_bytes() -> usize {
    16
}

fn default_sniff_timeout_ms() -> u64 {
    5000
}

/// Application configuration.
///
/// Loaded from a TOML file; `listen_address` and `upstream_address` can be
/// overridden from the command line.
///
/// # Examples
///
/// ```
/// use connsniff::configuration::config::Config;
///
/// let config = Config::from_toml_str(
///     r#"
///     listen_address = "127.0.0.1:8443"
///     upstream_address = "backend.internal:443"
///
///     [sniffer]
///     log_payload = false
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.sniff_bytes, 16);
/// assert!(!config.sniffer.log_payload);
/// ```
///
/// # Fields Overview
///
/// - `listen_address`: socket address the listener binds to
/// - `upstream_address`: `host:port` every connection is relayed to once its prefix was sniffed
/// - `sniff_bytes`: number of leading bytes to sniff before the handoff
/// - `sniff_timeout_ms`: how long to wait for those bytes before handing off anyway
/// - `sniffer`: per-connection mirroring and logging settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub listen_address: String,

    pub upstream_address: String,

    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,

    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,

    #[serde(default)]
    pub sniffer: SnifferConfig,
}

impl Config {
    /// Reads and validates the configuration stored at `path`.
    ///
    /// # Errors
    /// - `ConfigError::IoError` if the file cannot be read
    /// - `ConfigError::TomlError` if it is not valid TOML for this structure
    /// - any error returned by [`Config::validate`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Replaces the addresses with command-line values, when given, and
    /// validates the result.
    pub fn apply_overrides(
        &mut self,
        listen_address: Option<String>,
        upstream_address: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen_address) = listen_address {
            self.listen_address = listen_address;
        }
        if let Some(upstream_address) = upstream_address {
            self.upstream_address = upstream_address;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::BadAddressFormatting(format!(
                "listen_address '{}' is not a socket address",
                self.listen_address
            )));
        }

        // The upstream may be a host name, so only the shape is checked here.
        let valid_upstream = self
            .upstream_address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid_upstream {
            return Err(ConfigError::BadAddressFormatting(format!(
                "upstream_address '{}' is not host:port",
                self.upstream_address
            )));
        }

        if self.sniff_bytes == 0 || self.sniff_bytes > MAX_SNIFF_BYTES {
            return Err(ConfigError::NotInRange(format!(
                "sniff_bytes must be between 1 and {}, got {}",
                MAX_SNIFF_BYTES, self.sniff_bytes
            )));
        }

        if self.sniff_timeout_ms == 0 {
            return Err(ConfigError::NotInRange(
                "sniff_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}
