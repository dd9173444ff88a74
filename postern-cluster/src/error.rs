use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode IDENTIFY body: {0}")]
    Encode(#[from] serde_json::Error),

    /// The discovery service answered with an `E_*` error.
    #[error("Discovery service rejected {command}: {reason}")]
    Rejected { command: String, reason: String },

    #[error("Unexpected reply to {command}: {reply}")]
    Unexpected { command: String, reply: String },

    #[error("Response too large: {0} bytes (max {max})", max = crate::protocol::MAX_RESPONSE_SIZE)]
    TooLarge(u32),

    #[error("Timed out waiting for a reply to {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
