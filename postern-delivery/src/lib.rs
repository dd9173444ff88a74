//! Delivery worker: drains queue channels and hands each message to a
//! [`Transport`].
//!
//! - [`Worker`]: pull loop per channel, bounded concurrency, outcome mapping
//!   to ack / requeue with backoff / dead-letter
//! - [`SmtpTransport`]: MX lookup (or a fixed relay) and one SMTP transaction
//! - [`Backoff`]: exponential retry delays with jitter

mod backoff;
mod config;
mod dns;
mod error;
mod transport;
mod worker;

pub use backoff::Backoff;
pub use config::{DeliveryConfig, split_host_port};
pub use dns::{DnsConfig, DnsError, MailServer, MxResolver};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use transport::{SmtpTransport, Transport};
pub use worker::Worker;
