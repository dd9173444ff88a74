use thiserror::Error;

/// The scanner could not produce a verdict.
///
/// At startup this is fatal when scanning is mandatory; during a session it
/// becomes a temporary rejection.
#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("No content scanner address configured")]
    NoAddresses,

    /// The last address tried failed; earlier failures were logged.
    #[error("Content scanner at {address} unavailable: {reason}")]
    Unavailable { address: String, reason: String },
}

impl ScannerError {
    pub(crate) fn unavailable(address: &str, reason: impl ToString) -> Self {
        Self::Unavailable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
