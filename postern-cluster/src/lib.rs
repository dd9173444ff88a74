//! Advertises the channels this node hosts to lookupd-compatible discovery
//! services. Registration only: no message data crosses nodes.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;

pub use config::ClusterConfig;
pub use coordinator::{Coordinator, PeerState, Registration, RegistrationSource, Topology};
pub use error::ClusterError;
