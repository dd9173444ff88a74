use std::time::Duration;

use postern_common::error::ConfigError;
use serde::{Deserialize, Serialize};

use crate::types::is_valid_channel_name;

/// What happens to a message whose retries would outlast the retry window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryCeilingPolicy {
    /// Dead-letter it with [`DeadLetterReason::RetryCeiling`](crate::DeadLetterReason::RetryCeiling).
    #[default]
    DeadLetter,
    /// Drop it as if delivered, logging a warning.
    Done,
}

/// A channel and the topic it is advertised under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub topic: String,
    pub name: String,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
        }
    }
}

/// Configuration for the durable queue.
///
/// ```ron
/// queue: (
///     channels: [(topic: "outbound", name: "delivery")],
///     msg_timeout: 600,
///     max_req_timeout: 3600,
///     mem_queue_size: 0,
/// )
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Channels created at startup.
    #[serde(default = "defaults::channels")]
    pub channels: Vec<ChannelSpec>,

    /// Topic used for channels created on first use.
    #[serde(default = "defaults::topic")]
    pub default_topic: String,

    /// In-flight visibility deadline of one delivery attempt.
    ///
    /// Default: 600 seconds
    #[serde(default = "defaults::msg_timeout", with = "postern_common::config::seconds")]
    pub msg_timeout: Duration,

    /// Absolute lifetime of a message, measured from acceptance.
    ///
    /// Default: 54000 seconds (15 hours)
    #[serde(
        default = "defaults::max_msg_timeout",
        with = "postern_common::config::seconds"
    )]
    pub max_msg_timeout: Duration,

    /// Cumulative retry window, opened by the first requeue.
    ///
    /// Default: 3600 seconds
    #[serde(
        default = "defaults::max_req_timeout",
        with = "postern_common::config::seconds"
    )]
    pub max_req_timeout: Duration,

    /// Records buffered before a forced flush. Zero syncs every record before
    /// the operation returns.
    #[serde(default)]
    pub mem_queue_size: usize,

    /// Flush period for buffered records when `mem_queue_size` is non-zero.
    ///
    /// Default: 2 seconds
    #[serde(
        default = "defaults::sync_interval",
        with = "postern_common::config::seconds"
    )]
    pub sync_interval: Duration,

    /// Period of the recovery sweep.
    ///
    /// Default: 0.1 seconds
    #[serde(
        default = "defaults::sweep_interval",
        with = "postern_common::config::seconds"
    )]
    pub sweep_interval: Duration,

    /// Longest a blocked pull waits before looking again.
    ///
    /// Default: 1 second
    #[serde(
        default = "defaults::poll_interval",
        with = "postern_common::config::seconds"
    )]
    pub poll_interval: Duration,

    /// Superseded journal records tolerated before compaction.
    #[serde(default = "defaults::compact_threshold")]
    pub compact_threshold: usize,

    #[serde(default)]
    pub retry_ceiling: RetryCeilingPolicy,

    /// Trace every journal record at debug level.
    #[serde(default)]
    pub log_journal: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            channels: defaults::channels(),
            default_topic: defaults::topic(),
            msg_timeout: defaults::msg_timeout(),
            max_msg_timeout: defaults::max_msg_timeout(),
            max_req_timeout: defaults::max_req_timeout(),
            mem_queue_size: 0,
            sync_interval: defaults::sync_interval(),
            sweep_interval: defaults::sweep_interval(),
            poll_interval: defaults::poll_interval(),
            compact_threshold: defaults::compact_threshold(),
            retry_ceiling: RetryCeilingPolicy::default(),
            log_journal: false,
        }
    }
}

impl QueueConfig {
    /// # Errors
    /// The first field whose value cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.msg_timeout.is_zero() {
            return Err(ConfigError::invalid("queue.msg_timeout", "must be greater than zero"));
        }

        if self.max_msg_timeout < self.msg_timeout {
            return Err(ConfigError::invalid(
                "queue.max_msg_timeout",
                "must not be shorter than queue.msg_timeout",
            ));
        }

        for (field, value) in [
            ("queue.sweep_interval", self.sweep_interval),
            ("queue.poll_interval", self.poll_interval),
            ("queue.sync_interval", self.sync_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if !is_valid_channel_name(&self.default_topic) {
            return Err(ConfigError::invalid(
                "queue.default_topic",
                format!("{:?} is not a valid topic name", self.default_topic),
            ));
        }

        for spec in &self.channels {
            if !is_valid_channel_name(&spec.name) || !is_valid_channel_name(&spec.topic) {
                return Err(ConfigError::invalid(
                    "queue.channels",
                    format!("{}/{} is not a valid topic/channel pair", spec.topic, spec.name),
                ));
            }
        }

        Ok(())
    }

    pub(crate) const fn is_synchronous(&self) -> bool {
        self.mem_queue_size == 0
    }
}

mod defaults {
    use std::time::Duration;

    use super::ChannelSpec;

    pub fn channels() -> Vec<ChannelSpec> {
        vec![ChannelSpec::new("outbound", "delivery")]
    }

    pub fn topic() -> String {
        "outbound".to_string()
    }

    pub const fn msg_timeout() -> Duration {
        Duration::from_secs(600)
    }

    pub const fn max_msg_timeout() -> Duration {
        Duration::from_secs(15 * 60 * 60)
    }

    pub const fn max_req_timeout() -> Duration {
        Duration::from_secs(60 * 60)
    }

    pub const fn sync_interval() -> Duration {
        Duration::from_secs(2)
    }

    pub const fn sweep_interval() -> Duration {
        Duration::from_millis(100)
    }

    pub const fn poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub const fn compact_threshold() -> usize {
        1024
    }
}
