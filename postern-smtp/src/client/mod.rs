//! Outbound SMTP client used by the delivery worker.
//!
//! Supports plain TCP connections with a STARTTLS upgrade. Every reply is
//! returned as a [`Response`]; mapping codes to delivery outcomes is left to
//! the caller.

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
