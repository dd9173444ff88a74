use std::time::Duration;

use postern_common::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Content scanner settings.
///
/// ```ron
/// scanner: (
///     enabled: true,
///     addresses: ["127.0.0.1:3310"],
///     timeout: 30,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// clamd `host:port` addresses, tried in order.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Bound on one connect/request/reply exchange.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_timeout", with = "postern_common::config::seconds")]
    pub timeout: Duration,

    /// Refuse to start when the scanner does not answer a ping.
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_mandatory() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addresses: Vec::new(),
            timeout: default_timeout(),
            mandatory: default_mandatory(),
        }
    }
}

impl ScannerConfig {
    /// # Errors
    /// When enabled without addresses, or with a zero timeout
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.addresses.is_empty() {
            return Err(ConfigError::invalid(
                "scanner.addresses",
                "at least one address is required when scanning is enabled",
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("scanner.timeout", "must be greater than zero"));
        }

        Ok(())
    }
}
