use std::time::Duration;

use postern_common::{
    config::{ClientTimeouts, TlsConfig, seconds},
    error::ConfigError,
    host::hostname,
};
use postern_queue::types::is_valid_channel_name;
use serde::{Deserialize, Serialize};

use crate::{backoff::Backoff, dns::DnsConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Channels drained by the worker.
    #[serde(default = "defaults::channels")]
    pub channels: Vec<String>,

    /// Upper bound on simultaneous delivery attempts across all channels.
    ///
    /// Default: 16
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Send everything to this `host[:port]` instead of looking up MX records.
    #[serde(default)]
    pub relay: Option<String>,

    /// Port used for MX hosts, and for a relay without an explicit port.
    ///
    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Name announced in EHLO. Defaults to the system hostname.
    #[serde(default)]
    pub helo_name: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,

    /// First retry delay; doubles with every attempt.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_retry_delay", with = "seconds")]
    pub base_retry_delay: Duration,

    /// Default: 3600 seconds
    #[serde(default = "defaults::max_retry_delay", with = "seconds")]
    pub max_retry_delay: Duration,

    /// Retry delays are randomised within ±`retry_jitter`.
    ///
    /// Default: 0.2
    #[serde(default = "defaults::retry_jitter")]
    pub retry_jitter: f64,

    #[serde(default)]
    pub smtp_timeouts: ClientTimeouts,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            channels: defaults::channels(),
            max_concurrent: defaults::max_concurrent(),
            relay: None,
            port: defaults::port(),
            helo_name: None,
            tls: TlsConfig::default(),
            base_retry_delay: defaults::base_retry_delay(),
            max_retry_delay: defaults::max_retry_delay(),
            retry_jitter: defaults::retry_jitter(),
            smtp_timeouts: ClientTimeouts::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// # Errors
    /// The first field with an unusable value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.channels.is_empty() {
            return Err(ConfigError::invalid(
                "delivery.channels",
                "at least one channel is required",
            ));
        }

        if let Some(channel) = self.channels.iter().find(|c| !is_valid_channel_name(c)) {
            return Err(ConfigError::invalid(
                "delivery.channels",
                format!("{channel:?} is not a valid channel name"),
            ));
        }

        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("delivery.max_concurrent", "must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::invalid(
                "delivery.retry_jitter",
                "must be between 0.0 and 1.0",
            ));
        }

        if self.base_retry_delay > self.max_retry_delay {
            return Err(ConfigError::invalid(
                "delivery.base_retry_delay",
                "must not exceed max_retry_delay",
            ));
        }

        if let Some(relay) = self.relay.as_deref() {
            split_host_port(relay, self.port)?;
        }

        Ok(())
    }

    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.base_retry_delay, self.max_retry_delay, self.retry_jitter)
    }

    pub fn helo_name(&self) -> String {
        self.helo_name.clone().unwrap_or_else(hostname)
    }
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port`.
///
/// # Errors
/// An empty host or a port that is not a number
pub fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::invalid("delivery.relay", format!("{value:?}: {reason}"));

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing closing bracket"))?;
        match after {
            "" => (host, None),
            _ => (
                host,
                Some(after.strip_prefix(':').ok_or_else(|| invalid("expected ':' after ']'"))?),
            ),
        }
    } else {
        match value.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            _ => (value, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(port) => port.parse().map_err(|_| invalid("invalid port"))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

mod defaults {
    use std::time::Duration;

    pub const fn enabled() -> bool {
        true
    }

    pub fn channels() -> Vec<String> {
        vec!["delivery".to_string()]
    }

    pub const fn max_concurrent() -> usize {
        16
    }

    pub const fn port() -> u16 {
        25
    }

    pub const fn base_retry_delay() -> Duration {
        Duration::from_secs(60)
    }

    pub const fn max_retry_delay() -> Duration {
        Duration::from_secs(3600)
    }

    pub const fn retry_jitter() -> f64 {
        0.2
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config: DeliveryConfig = ron::from_str("()").unwrap();
        assert!(config.enabled);
        assert_eq!(config.channels, ["delivery"]);
        assert_eq!(config.max_concurrent, 16);
        assert_eq!(config.port, 25);
        assert_eq!(config.base_retry_delay, Duration::from_secs(60));
        assert_eq!(config.max_retry_delay, Duration::from_secs(3600));
        assert!((config.retry_jitter - 0.2).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn helo_name_defaults_to_the_system_hostname() {
        let mut config = DeliveryConfig::default();
        assert_eq!(config.helo_name(), hostname());

        config.helo_name = Some("mx.example.net".to_string());
        assert_eq!(config.helo_name(), "mx.example.net");
    }

    #[test]
    fn overrides() {
        let config: DeliveryConfig = ron::from_str(
            r#"(
                relay: Some("smarthost.example.net:2525"),
                max_concurrent: 4,
                base_retry_delay: 0.5,
                tls: (policy: Required),
            )"#,
        )
        .unwrap();
        assert_eq!(config.relay.as_deref(), Some("smarthost.example.net:2525"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.base_retry_delay, Duration::from_millis(500));
        assert!(config.tls.is_required());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values() {
        let mut config = DeliveryConfig {
            max_concurrent: 0,
            ..DeliveryConfig::default()
        };
        assert!(config.validate().is_err());

        config.max_concurrent = 1;
        config.channels = vec!["bad channel".to_string()];
        assert!(config.validate().is_err());

        config.channels = vec!["delivery".to_string()];
        config.retry_jitter = 1.5;
        assert!(config.validate().is_err());

        config.retry_jitter = 0.2;
        config.relay = Some("host:notaport".to_string());
        assert!(config.validate().is_err());

        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn host_and_port() {
        assert_eq!(split_host_port("mail.example.com", 25).unwrap(), ("mail.example.com".into(), 25));
        assert_eq!(split_host_port("127.0.0.1:2525", 25).unwrap(), ("127.0.0.1".into(), 2525));
        assert_eq!(split_host_port("[::1]:587", 25).unwrap(), ("::1".into(), 587));
        assert_eq!(split_host_port("[::1]", 25).unwrap(), ("::1".into(), 25));
        assert_eq!(split_host_port("::1", 25).unwrap(), ("::1".into(), 25));
        assert!(split_host_port(":25", 25).is_err());
        assert!(split_host_port("[::1", 25).is_err());
    }
}
