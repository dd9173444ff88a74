//! Typed delivery failures.
//!
//! The worker only cares which of three buckets a failure lands in:
//! - [`PermanentError`]: 5xx replies and unroutable mail, dead-lettered
//! - [`TemporaryError`]: 4xx replies and network trouble, requeued with backoff
//! - [`SystemError`]: internal faults, treated like temporary ones

use postern_smtp::client::{ClientError, Response};
use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("All recipients rejected: {0}")]
    RecipientsRejected(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server busy: {0}")]
    ServerBusy(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether the next mail server for the domain is worth trying.
    ///
    /// Only failures that happened before the server accepted us qualify;
    /// anything later is an answer about the message itself.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Temporary(
                TemporaryError::ConnectionFailed(_)
                    | TemporaryError::ServerBusy(_)
                    | TemporaryError::TlsHandshakeFailed(_)
            )
        )
    }

    /// Map a negative reply to `what` onto its error class.
    #[must_use]
    pub fn from_response(what: &str, response: &Response) -> Self {
        if response.is_temporary_error() {
            TemporaryError::SmtpTemporary(format!("{what}: {response}")).into()
        } else if response.is_permanent_error() {
            PermanentError::MessageRejected(format!("{what}: {response}")).into()
        } else {
            SystemError::Internal(format!("Unexpected reply to {what}: {response}")).into()
        }
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => PermanentError::NoMailServers(domain).into(),
            DnsError::DomainNotFound(domain) => PermanentError::DomainNotFound(domain).into(),
            DnsError::LookupFailed(err) => TemporaryError::DnsLookupFailed(err.to_string()).into(),
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(err) => {
                TemporaryError::ConnectionFailed(format!("I/O error: {err}")).into()
            }
            ClientError::ConnectionClosed => {
                TemporaryError::ConnectionFailed("Connection closed unexpectedly".to_string())
                    .into()
            }
            ClientError::Tls(msg) => TemporaryError::TlsHandshakeFailed(msg).into(),
            ClientError::Parse(msg) => {
                SystemError::Internal(format!("SMTP protocol parse error: {msg}")).into()
            }
        }
    }
}
