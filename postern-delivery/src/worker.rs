use std::{sync::Arc, time::Duration};

use postern_common::{Signal, internal, stopped, tracing};
use postern_queue::{
    DeadLetterReason, DurableQueue, Message, QueueError, RequeueOutcome, types::now_ms,
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, broadcast},
    task::JoinSet,
};

use crate::{backoff::Backoff, config::DeliveryConfig, transport::Transport};

/// How long to wait before pulling again after an unexpected queue error.
const PULL_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Drains the configured channels, one delivery attempt per message.
pub struct Worker {
    queue: Arc<dyn DurableQueue>,
    transport: Arc<dyn Transport>,
    channels: Vec<String>,
    permits: Arc<Semaphore>,
    backoff: Backoff,
    /// Matches the queue's in-flight deadline, after which the sweep hands
    /// the message to someone else.
    attempt_timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("channels", &self.channels)
            .field("available", &self.permits.available_permits())
            .field("backoff", &self.backoff)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        config: &DeliveryConfig,
        queue: Arc<dyn DurableQueue>,
        transport: Arc<dyn Transport>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            transport,
            channels: config.channels.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            backoff: config.backoff(),
            attempt_timeout,
        }
    }

    /// Pull and deliver until shutdown or until the queue closes, then wait
    /// for the attempts already running.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Delivery worker starting on {:?} with {} concurrent attempts",
            self.channels,
            self.permits.available_permits()
        );

        let worker = Arc::new(self);
        let mut loops = JoinSet::new();

        for channel in worker.channels.clone() {
            loops.spawn(Arc::clone(&worker).drain(channel, shutdown.resubscribe()));
        }

        while loops.join_next().await.is_some() {}

        internal!(level = INFO, "Delivery worker stopped");
    }

    async fn drain(self: Arc<Self>, channel: String, mut shutdown: broadcast::Receiver<Signal>) {
        let mut attempts = JoinSet::new();

        loop {
            while attempts.try_join_next().is_some() {}

            // Capacity first, so a claimed message never waits for a slot.
            let permit = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                message = self.queue.pull(&channel) => match message {
                    Ok(message) => message,
                    Err(QueueError::Closed) => {
                        internal!(level = DEBUG, "Channel {channel} closed to new pulls");
                        break;
                    }
                    Err(err) => {
                        internal!(level = ERROR, "Failed to pull from {channel}: {err}");
                        drop(permit);
                        tokio::time::sleep(PULL_ERROR_PAUSE).await;
                        continue;
                    }
                },
            };

            attempts.spawn(Arc::clone(&self).attempt(message, permit));
        }

        if !attempts.is_empty() {
            internal!(
                level = INFO,
                "Waiting for {} delivery attempt(s) on {channel}",
                attempts.len()
            );
        }
        while attempts.join_next().await.is_some() {}
    }

    /// Time left on the message's lease, never more than `attempt_timeout`.
    fn budget(&self, message: &Message, now: u64) -> Duration {
        message.deadline.map_or(self.attempt_timeout, |deadline| {
            Duration::from_millis(deadline.saturating_sub(now)).min(self.attempt_timeout)
        })
    }

    async fn attempt(self: Arc<Self>, message: Message, _permit: OwnedSemaphorePermit) {
        let lease = message.lease();
        let budget = self.budget(&message, now_ms());

        let result = match tokio::time::timeout(budget, self.transport.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => {
                internal!(
                    level = WARN,
                    "Attempt {} for {} abandoned after {budget:?}; the queue will recover it",
                    message.attempts,
                    message.id
                );
                return;
            }
        };

        let resolved = match result {
            Ok(()) => self.queue.ack(&message.id).await.map(|()| RequeueOutcome::Done),
            Err(err) if err.is_permanent() => {
                internal!(level = WARN, "Delivery of {} failed permanently: {err}", message.id);
                self.queue
                    .dead_letter(&lease, DeadLetterReason::Permanent(err.to_string()))
                    .await
            }
            Err(err) => {
                let delay = self.backoff.delay(message.attempts);
                internal!(
                    level = INFO,
                    "Delivery of {} failed on attempt {}, retrying in {delay:?}: {err}",
                    message.id,
                    message.attempts
                );
                self.queue.requeue(&lease, delay).await
            }
        };

        match resolved {
            Ok(RequeueOutcome::Stale) => internal!(
                level = WARN,
                "Lease on {} expired before the attempt finished",
                message.id
            ),
            Ok(outcome) => internal!(level = DEBUG, "{} resolved as {outcome:?}", message.id),
            Err(err) => internal!(
                level = ERROR,
                "Failed to record the outcome for {}: {err}",
                message.id
            ),
        }
    }
}
