//! Crash-durable work queue.
//!
//! Messages live in named channels. Each channel journals every transition to
//! its own write-ahead log before applying it, keeps ready, delayed and
//! in-flight indices in memory, and is swept periodically to recover messages
//! whose holder missed its deadline.

mod channel;
pub mod config;
pub mod dead_letter;
pub mod error;
mod journal;
pub mod message;
mod metadata;
mod queue;
pub mod types;

pub use channel::RequeueOutcome;
pub use config::{ChannelSpec, QueueConfig, RetryCeilingPolicy};
pub use dead_letter::{DeadLetterSink, LogSink};
pub use error::{PersistError, QueueError};
pub use message::{DeadLetterReason, Lease, Message, MessageState};
pub use metadata::{FORMAT_FILE, FORMAT_VERSION};
pub use queue::{DurableQueue, Queue};
pub use types::MessageId;
