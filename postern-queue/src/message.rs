use std::{sync::Arc, time::Duration};

use postern_common::envelope::Envelope;
use serde::{Deserialize, Serialize};

use crate::types::MessageId;

/// Where a message is in its lifecycle. Exactly one applies at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Waiting to be pulled, possibly not visible until `visible_at`.
    Ready,
    /// Claimed by exactly one worker until acked or its deadline passes.
    InFlight,
    /// Delivered and removed from the store.
    Done,
    /// Terminal failure, retained for inspection.
    DeadLettered,
}

impl MessageState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DeadLettered)
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// The destination rejected the message permanently.
    Permanent(String),
    /// Retrying would run past the cumulative retry window.
    RetryCeiling,
    /// The absolute lifetime of the message ran out.
    Expired,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permanent(reason) => write!(f, "permanent failure: {reason}"),
            Self::RetryCeiling => f.write_str("retry window exhausted"),
            Self::Expired => f.write_str("message lifetime exceeded"),
        }
    }
}

/// Proof of holding a message in flight.
///
/// A message recovered by the sweep and pulled again gets a new attempt
/// number, so the previous holder's lease no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub id: MessageId,
    pub attempts: u32,
}

/// A queued unit of work: one envelope and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub envelope: Envelope,
    pub payload: Arc<[u8]>,
    /// Milliseconds since the epoch when the message was accepted.
    pub enqueued_at: u64,
    /// Delivery attempts so far, incremented once per pull.
    pub attempts: u32,
    pub state: MessageState,
    /// Not eligible for a pull before this instant.
    pub visible_at: u64,
    /// Visibility deadline while in flight.
    pub deadline: Option<u64>,
    /// Start of the retry window, set by the first requeue.
    pub retry_started_at: Option<u64>,
    pub dead_letter: Option<DeadLetterReason>,
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        channel: String,
        envelope: Envelope,
        payload: Arc<[u8]>,
        now: u64,
    ) -> Self {
        Self {
            id,
            channel,
            envelope,
            payload,
            enqueued_at: now,
            attempts: 0,
            state: MessageState::Ready,
            visible_at: now,
            deadline: None,
            retry_started_at: None,
            dead_letter: None,
        }
    }

    #[must_use]
    pub const fn lease(&self) -> Lease {
        Lease {
            id: self.id,
            attempts: self.attempts,
        }
    }

    /// Time spent retrying as of `now`.
    #[must_use]
    pub fn retry_elapsed(&self, now: u64) -> Duration {
        self.retry_started_at
            .map_or(Duration::ZERO, |started| {
                Duration::from_millis(now.saturating_sub(started))
            })
    }

    /// Whether the absolute lifetime `max_lifetime` ends at or before `at`.
    pub(crate) const fn expired_at(&self, at: u64, max_lifetime: u64) -> bool {
        at >= self.enqueued_at.saturating_add(max_lifetime)
    }
}

/// Whether a retry becoming visible at `visible_at` stays inside the retry
/// window. The boundary itself is inside.
pub(crate) const fn within_retry_window(started: u64, visible_at: u64, window: u64) -> bool {
    visible_at.saturating_sub(started) <= window
}
