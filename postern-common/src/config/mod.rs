//! Configuration building blocks shared across crates.
//!
//! - [`timeouts`]: frontend session timeouts and outbound SMTP command timeouts
//! - [`tls`]: outbound TLS policy
//! - [`seconds`]: serde helpers for durations written as seconds

pub mod seconds;
pub mod timeouts;
pub mod tls;

pub use timeouts::{ClientTimeouts, ServerTimeouts};
pub use tls::{TlsConfig, TlsPolicy};
