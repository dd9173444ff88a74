//! Outbound TLS settings.

use serde::{Deserialize, Serialize};

/// How STARTTLS is negotiated with a destination server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TlsPolicy {
    /// Use STARTTLS when advertised; reconnect in plaintext if it fails
    /// (RFC 3207 section 4.1).
    #[default]
    Opportunistic,

    /// STARTTLS must succeed or the attempt fails permanently.
    Required,

    /// Never attempt STARTTLS.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub policy: TlsPolicy,

    /// Skip certificate verification. Only meant for test relays with
    /// self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    #[must_use]
    pub const fn is_required(&self) -> bool {
        matches!(self.policy, TlsPolicy::Required)
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self.policy, TlsPolicy::Disabled)
    }
}
