use std::time::Duration;

use postern_common::{config::seconds, error::ConfigError, host::hostname};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,

    /// `host:port` of each discovery service.
    #[serde(default)]
    pub discovery: Vec<String>,

    /// Address other nodes should use to reach this one. Defaults to the
    /// host name.
    #[serde(default)]
    pub broadcast_address: Option<String>,

    /// Port advertised for this node's mail traffic.
    ///
    /// Default: 25
    #[serde(default = "defaults::tcp_port")]
    pub tcp_port: u16,

    /// Advertised HTTP port; postern has none, so 0 unless a proxy fronts it.
    #[serde(default)]
    pub http_port: u16,

    /// Default: 15 seconds
    #[serde(default = "defaults::heartbeat", with = "seconds")]
    pub heartbeat: Duration,

    /// Bounds every request/response exchange.
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::request_timeout", with = "seconds")]
    pub request_timeout: Duration,

    /// First delay before reconnecting; doubles up to `max_reconnect_delay`.
    ///
    /// Default: 1 second
    #[serde(default = "defaults::reconnect_delay", with = "seconds")]
    pub reconnect_delay: Duration,

    /// Default: 60 seconds
    #[serde(default = "defaults::max_reconnect_delay", with = "seconds")]
    pub max_reconnect_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery: Vec::new(),
            broadcast_address: None,
            tcp_port: defaults::tcp_port(),
            http_port: 0,
            heartbeat: defaults::heartbeat(),
            request_timeout: defaults::request_timeout(),
            reconnect_delay: defaults::reconnect_delay(),
            max_reconnect_delay: defaults::max_reconnect_delay(),
        }
    }
}

impl ClusterConfig {
    /// # Errors
    /// When enabled without discovery addresses, or with a malformed one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.discovery.is_empty() {
            return Err(ConfigError::invalid(
                "cluster.discovery",
                "at least one discovery address is required when clustering is enabled",
            ));
        }

        for address in &self.discovery {
            let valid = address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::invalid(
                    "cluster.discovery",
                    format!("{address:?} is not host:port"),
                ));
            }
        }

        if self.heartbeat.is_zero() {
            return Err(ConfigError::invalid("cluster.heartbeat", "must be greater than zero"));
        }

        if self.reconnect_delay.is_zero() || self.reconnect_delay > self.max_reconnect_delay {
            return Err(ConfigError::invalid(
                "cluster.reconnect_delay",
                "must be greater than zero and at most max_reconnect_delay",
            ));
        }

        Ok(())
    }

    pub fn broadcast_address(&self) -> String {
        self.broadcast_address.clone().unwrap_or_else(hostname)
    }
}

mod defaults {
    use std::time::Duration;

    pub const fn tcp_port() -> u16 {
        25
    }

    pub const fn heartbeat() -> Duration {
        Duration::from_secs(15)
    }

    pub const fn request_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub const fn reconnect_delay() -> Duration {
        Duration::from_secs(1)
    }

    pub const fn max_reconnect_delay() -> Duration {
        Duration::from_secs(60)
    }
}
