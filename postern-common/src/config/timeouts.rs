//! Timeouts for both directions of SMTP traffic.
//!
//! Server-side values follow RFC 5321 section 4.5.3.2; client-side values are
//! shorter so a stuck destination fails an attempt well inside the queue's
//! in-flight deadline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts applied by the ingestion frontend to each session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Waiting for the next command line.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Waiting for each block of message data after `354`.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::server_data_block_secs")]
    pub data_block_secs: u64,

    /// Maximum lifetime of one connection.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_block_secs: defaults::server_data_block_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

impl ServerTimeouts {
    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data_block(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    #[must_use]
    pub const fn connection(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

/// Per-command timeouts used when delivering to a remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTimeouts {
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    #[serde(default = "defaults::client_command_secs")]
    pub ehlo_secs: u64,

    #[serde(default = "defaults::client_command_secs")]
    pub starttls_secs: u64,

    #[serde(default = "defaults::client_command_secs")]
    pub mail_from_secs: u64,

    #[serde(default = "defaults::client_command_secs")]
    pub rcpt_to_secs: u64,

    /// DATA command plus message transfer.
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// A QUIT timeout never fails a delivery that already succeeded.
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            ehlo_secs: defaults::client_command_secs(),
            starttls_secs: defaults::client_command_secs(),
            mail_from_secs: defaults::client_command_secs(),
            rcpt_to_secs: defaults::client_command_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }
    pub const fn server_data_block_secs() -> u64 {
        180
    }
    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_command_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
}
