//! Listen endpoint addresses of the form `scheme://host[:port]`.

use std::{
    fmt::{self, Display, Formatter},
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use postern_common::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plaintext, with STARTTLS offered when TLS material is configured.
    Smtp,
    /// TLS from the first byte.
    Smtps,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Smtp => 25,
            Self::Smtps => 465,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Smtps => "smtps",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub const fn is_implicit_tls(&self) -> bool {
        matches!(self.scheme, Scheme::Smtps)
    }

    /// The address to bind. Host names are resolved once, taking the first
    /// address returned.
    ///
    /// # Errors
    /// If the host cannot be resolved
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                ConfigError::invalid(
                    "frontend.listeners.address",
                    format!("unable to resolve {}", self.host),
                )
            })
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            ConfigError::invalid("frontend.listeners.address", format!("{value:?}: {reason}"))
        };

        let (scheme, rest) = value
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://host[:port]"))?;

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "smtp" => Scheme::Smtp,
            "smtps" => Scheme::Smtps,
            _ => return Err(invalid("scheme must be smtp or smtps")),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after {
                "" => None,
                after => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("expected :port after IPv6 address"))?,
                ),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            None => scheme.default_port(),
            // 0 asks the OS for an ephemeral port.
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid("port must be between 0 and 65535"))?,
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}
