use std::path::PathBuf;

use postern_common::{config::ServerTimeouts, controller::BindPolicy, error::ConfigError};
use postern_queue::types::is_valid_channel_name;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// One listen endpoint.
///
/// ```ron
/// (
///     address: "smtp://0.0.0.0:2525",
///     tls: Some((certificate: "tls/cert.pem", key: "tls/key.pem")),
///     max_message_size: 10485760,
/// )
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub address: Endpoint,

    /// Required for `smtps`; enables STARTTLS for `smtp`.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    /// Host name announced in the greeting. Defaults to the system hostname.
    #[serde(default)]
    pub banner: String,

    /// Largest accepted message in bytes; `0` disables the limit.
    ///
    /// Default: 10 MiB
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl ListenerConfig {
    pub fn new(address: Endpoint) -> Self {
        Self {
            address,
            tls: None,
            banner: String::new(),
            max_message_size: defaults::max_message_size(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

/// The ingestion frontend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub bind_policy: BindPolicy,

    /// Channel accepted messages are enqueued on.
    #[serde(default = "defaults::channel")]
    pub channel: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            listeners: Vec::new(),
            bind_policy: BindPolicy::default(),
            channel: defaults::channel(),
        }
    }
}

impl FrontendConfig {
    /// # Errors
    /// When enabled without listeners, with an invalid channel name, or with
    /// an `smtps` listener lacking TLS material
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.listeners.is_empty() {
            return Err(ConfigError::invalid(
                "frontend.listeners",
                "at least one listener is required when the frontend is enabled",
            ));
        }

        if !is_valid_channel_name(&self.channel) {
            return Err(ConfigError::invalid(
                "frontend.channel",
                format!("{:?} is not a valid channel name", self.channel),
            ));
        }

        for listener in &self.listeners {
            if listener.address.is_implicit_tls() && listener.tls.is_none() {
                return Err(ConfigError::invalid(
                    "frontend.listeners.tls",
                    format!("{} requires a certificate and key", listener.address),
                ));
            }
        }

        Ok(())
    }
}

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn channel() -> String {
        "delivery".to_string()
    }

    pub const fn max_message_size() -> usize {
        10 * 1024 * 1024
    }
}
