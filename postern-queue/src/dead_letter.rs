use async_trait::async_trait;
use postern_common::internal;

use crate::message::{DeadLetterReason, Message};

/// Receives every message that reaches the dead-letter state.
///
/// Called after the transition is recorded, outside any queue lock. Bounce
/// generation hangs off this.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_lettered(&self, message: &Message, reason: &DeadLetterReason);
}

/// Logs dead-lettered messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl DeadLetterSink for LogSink {
    async fn dead_lettered(&self, message: &Message, reason: &DeadLetterReason) {
        internal!(
            level = WARN,
            "Message {} on {} from <{}> to {:?} dead-lettered after {} attempts: {reason}",
            message.id,
            message.channel,
            message.envelope.sender(),
            message.envelope.recipients(),
            message.attempts
        );
    }
}
