//! Error types for the postern-queue crate.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Durability could not be guaranteed.
///
/// Whoever receives one of these must not report the affected operation as
/// having succeeded.
#[derive(Debug, Error)]
pub enum PersistError {
    /// I/O on a journal, metadata or marker file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A record could not be encoded.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// A record or snapshot could not be decoded.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A file does not look like something this crate wrote.
    #[error("Corrupted queue file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The storage directory has no format marker and creation was declined.
    #[error("Queue storage at {0} is not initialised and auto-create is disabled")]
    SchemaMissing(PathBuf),

    /// The storage directory was written by an incompatible version.
    #[error("Queue storage format mismatch: found {found:?}, expected {expected:?}")]
    SchemaMismatch { found: String, expected: String },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The queue is shutting down and takes no new work.
    #[error("Queue is closed")]
    Closed,

    /// Channel names double as file names and are restricted.
    #[error("Invalid channel name {0:?}")]
    InvalidChannel(String),
}

impl QueueError {
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
