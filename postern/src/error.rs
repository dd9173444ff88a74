use std::{io, path::PathBuf, process::ExitCode};

use postern_common::error::{BindError, ConfigError, ProtocolError};
use postern_delivery::DeliveryError;
use postern_queue::{PersistError, QueueError};
use postern_scanner::ScannerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unable to create storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Mandatory content scanner unavailable: {0}")]
    Scanner(#[from] ScannerError),

    #[error("Invalid listener: {0}")]
    Listener(#[from] ProtocolError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Unable to set up outbound delivery: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Unable to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    /// Queue state could not be made durable while shutting down.
    #[error("Shutdown flush failed: {0}")]
    Flush(#[source] PersistError),

    #[error("Shutdown left buffered queue records unflushed")]
    PendingRecords,
}

impl SupervisorError {
    /// 2 when shutdown could not make the queue durable, 1 for anything
    /// that stopped startup.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Flush(_) | Self::PendingRecords => 2,
            _ => 1,
        }
    }
}

impl From<&SupervisorError> for ExitCode {
    fn from(err: &SupervisorError) -> Self {
        Self::from(err.exit_code())
    }
}
