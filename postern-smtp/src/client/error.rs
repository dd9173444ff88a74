use std::io;

use thiserror::Error;

/// Errors raised by [`SmtpClient`](super::SmtpClient).
///
/// SMTP replies are never errors at this level; callers inspect the
/// [`Response`](super::Response) code themselves.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

impl ClientError {
    /// Whether the failure happened before or during the TCP/TLS exchange
    /// rather than because the server sent something unintelligible.
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
