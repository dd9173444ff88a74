pub mod config;
pub mod error;
pub mod supervisor;

pub use config::Config;
pub use error::SupervisorError;
pub use supervisor::{Running, check, run, start};
