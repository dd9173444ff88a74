//! Content scanning for accepted messages.

pub mod clamd;
pub mod config;
pub mod error;

use async_trait::async_trait;

pub use clamd::ClamdScanner;
pub use config::ScannerConfig;
pub use error::ScannerError;

/// Outcome of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    /// Carries the signature name reported by the scanner.
    Infected(String),
}

#[async_trait]
pub trait ContentScanner: Send + Sync {
    /// Health check.
    ///
    /// # Errors
    /// [`ScannerError`] if no configured scanner answers
    async fn ping(&self) -> Result<(), ScannerError>;

    /// # Errors
    /// [`ScannerError`] if no configured scanner produced a verdict
    async fn scan(&self, payload: &[u8]) -> Result<Verdict, ScannerError>;
}
