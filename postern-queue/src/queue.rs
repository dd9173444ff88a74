use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use postern_common::{Signal, envelope::Envelope, internal};
use tokio::{sync::broadcast, time::MissedTickBehavior};

use crate::{
    channel::{Channel, RequeueOutcome},
    config::{ChannelSpec, QueueConfig},
    dead_letter::{DeadLetterSink, LogSink},
    error::{PersistError, QueueError},
    message::{DeadLetterReason, Lease, Message, MessageState},
    metadata::{self, Metadata},
    types::{MessageId, is_valid_channel_name, millis, now_ms},
};

/// The narrow interface the frontend and delivery worker depend on.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Durably store a message on `channel`; it is ready immediately.
    ///
    /// # Errors
    /// [`QueueError::Persist`] if the write could not be made durable,
    /// [`QueueError::Closed`] once the queue is shutting down
    async fn enqueue(
        &self,
        channel: &str,
        envelope: Envelope,
        payload: Vec<u8>,
    ) -> Result<MessageId, QueueError>;

    /// Claim the oldest ready message, waiting for one to arrive.
    ///
    /// # Errors
    /// [`QueueError::Closed`] once the queue is shutting down
    async fn pull(&self, channel: &str) -> Result<Message, QueueError>;

    /// Claim the oldest ready message without waiting.
    ///
    /// # Errors
    /// As [`DurableQueue::pull`]
    async fn try_pull(&self, channel: &str) -> Result<Option<Message>, QueueError>;

    /// Mark a message delivered. Unknown or already finished IDs are a no-op.
    ///
    /// Takes an ID rather than a [`Lease`]: a holder whose lease was
    /// recovered still delivered the message, so its ack completes it even
    /// while a newer attempt holds the lease. That attempt's own resolution
    /// then reports [`RequeueOutcome::Stale`]. Delivery stays at-least-once.
    ///
    /// # Errors
    /// If the removal cannot be journalled
    async fn ack(&self, id: &MessageId) -> Result<(), QueueError>;

    /// Make a leased message ready again after `delay`, within the retry
    /// and lifetime ceilings.
    ///
    /// # Errors
    /// If the transition cannot be journalled
    async fn requeue(&self, lease: &Lease, delay: Duration) -> Result<RequeueOutcome, QueueError>;

    /// Dead-letter a leased message.
    ///
    /// # Errors
    /// If the transition cannot be journalled
    async fn dead_letter(
        &self,
        lease: &Lease,
        reason: DeadLetterReason,
    ) -> Result<RequeueOutcome, QueueError>;

    /// Snapshot which channels exist.
    ///
    /// # Errors
    /// If the snapshot cannot be written atomically
    async fn persist_metadata(&self) -> Result<(), PersistError>;

    /// Restore channels from the last snapshot and any journals beside it.
    ///
    /// # Errors
    /// If the snapshot or a journal cannot be read
    async fn load_metadata(&self) -> Result<(), PersistError>;
}

/// Journal-backed [`DurableQueue`].
pub struct Queue {
    root: PathBuf,
    config: QueueConfig,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    /// Which channel holds each message.
    index: DashMap<MessageId, String>,
    creating: tokio::sync::Mutex<()>,
    /// Monotonic within a millisecond, so ID order is enqueue order.
    ids: parking_lot::Mutex<ulid::Generator>,
    sink: Arc<dyn DeadLetterSink>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("root", &self.root)
            .field("channels", &self.channel_names())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Open the queue stored under `root`.
    ///
    /// Channels are not loaded until [`DurableQueue::load_metadata`] or
    /// [`Queue::ensure_channel`].
    ///
    /// # Errors
    /// [`PersistError::SchemaMissing`] if `root` has never been initialised
    /// and `auto_create` is false, [`PersistError::SchemaMismatch`] if it
    /// belongs to an incompatible format
    pub async fn open(
        root: impl Into<PathBuf>,
        config: QueueConfig,
        auto_create: bool,
    ) -> Result<Self, PersistError> {
        let root = root.into();
        metadata::ensure_format(&root, auto_create).await?;

        Ok(Self {
            root,
            config,
            channels: RwLock::new(HashMap::new()),
            index: DashMap::new(),
            creating: tokio::sync::Mutex::new(()),
            ids: parking_lot::Mutex::new(ulid::Generator::new()),
            sink: Arc::new(LogSink),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// `(topic, channel)` for every open channel.
    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        let mut specs: Vec<ChannelSpec> = self
            .channels
            .read()
            .values()
            .map(|channel| ChannelSpec::new(channel.topic(), channel.name()))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().get(name).cloned()
    }

    /// Open `spec` if it is not open yet. Idempotent.
    ///
    /// # Errors
    /// [`QueueError::InvalidChannel`] for an unusable name, or a journal
    /// that cannot be opened
    pub async fn ensure_channel(&self, spec: &ChannelSpec) -> Result<(), QueueError> {
        self.open_channel(spec).await.map(|_| ())
    }

    async fn open_channel(&self, spec: &ChannelSpec) -> Result<Arc<Channel>, QueueError> {
        if let Some(channel) = self.channel(&spec.name) {
            return Ok(channel);
        }

        if !is_valid_channel_name(&spec.name) {
            return Err(QueueError::InvalidChannel(spec.name.clone()));
        }

        let _creating = self.creating.lock().await;
        if let Some(channel) = self.channel(&spec.name) {
            return Ok(channel);
        }

        let channel = Channel::open(&self.root, spec, &self.config, now_ms()).await?;
        for id in channel.ids().await {
            self.index.insert(id, spec.name.clone());
        }

        self.channels
            .write()
            .insert(spec.name.clone(), Arc::clone(&channel));

        internal!(level = DEBUG, "Opened channel {}/{}", spec.topic, spec.name);
        Ok(channel)
    }

    /// The channel called `name`, created under the default topic if needed.
    async fn channel_or_create(&self, name: &str) -> Result<Arc<Channel>, QueueError> {
        match self.channel(name) {
            Some(channel) => Ok(channel),
            None => {
                self.open_channel(&ChannelSpec::new(self.config.default_topic.clone(), name))
                    .await
            }
        }
    }

    fn channel_of(&self, id: &MessageId) -> Option<Arc<Channel>> {
        let name = self.index.get(id)?.value().clone();
        self.channel(&name)
    }

    async fn report_dead(&self, dead: Vec<Message>) {
        for message in dead {
            let reason = message
                .dead_letter
                .clone()
                .unwrap_or(DeadLetterReason::Expired);
            self.sink.dead_lettered(&message, &reason).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop taking new work. Enqueue and pull fail with
    /// [`QueueError::Closed`]; in-flight messages can still be resolved.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            internal!(level = INFO, "Queue closed to new work");
        }

        for channel in self.channels.read().values() {
            channel.notify().notify_waiters();
        }
    }

    /// Write and sync every buffered record on every channel.
    ///
    /// # Errors
    /// The first channel that could not be synced; the others are still
    /// attempted
    pub async fn flush(&self) -> Result<(), PersistError> {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        let mut result = Ok(());

        for channel in channels {
            if let Err(err) = channel.flush().await {
                internal!(level = ERROR, "Failed to flush channel {}: {err}", channel.name());
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Whether any record is buffered but not yet durable.
    pub async fn has_pending(&self) -> bool {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        for channel in channels {
            if channel.has_pending().await {
                return true;
            }
        }
        false
    }

    async fn sweep(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        let now = now_ms();

        for channel in channels {
            let mut dead = Vec::new();
            let mut done = Vec::new();
            if let Err(err) = channel.sweep(&self.config, now, &mut dead, &mut done).await {
                internal!(level = ERROR, "Sweep of channel {} failed: {err}", channel.name());
            }
            for id in &done {
                self.index.remove(id);
            }
            self.report_dead(dead).await;
        }
    }

    /// Run the recovery sweep, and the periodic flush when records are
    /// buffered, until shutdown.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sync = tokio::time::interval(self.config.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        internal!(
            level = INFO,
            "Queue service started: sweep every {:?}, {}",
            self.config.sweep_interval,
            if self.config.is_synchronous() {
                "synchronous writes".to_string()
            } else {
                format!("flush every {:?}", self.config.sync_interval)
            }
        );

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Queue service received Shutdown signal");
                        break;
                    }
                }

                _ = sweep.tick() => self.sweep().await,

                _ = sync.tick(), if !self.config.is_synchronous() => {
                    if let Err(err) = self.flush().await {
                        internal!(level = ERROR, "Periodic queue flush failed: {err}");
                    }
                }
            }
        }
    }

    /// Non-terminal messages on `channel`.
    pub async fn depth(&self, channel: &str) -> usize {
        match self.channel(channel) {
            Some(channel) => channel.depth().await,
            None => 0,
        }
    }

    pub async fn in_flight(&self, channel: &str) -> usize {
        match self.channel(channel) {
            Some(channel) => channel.in_flight().await,
            None => 0,
        }
    }

    pub async fn dead_letters(&self, channel: &str) -> Vec<Message> {
        match self.channel(channel) {
            Some(channel) => channel.dead_letters().await,
            None => Vec::new(),
        }
    }

    /// Current state of a message, `Done` for recently acked ones and `None`
    /// for IDs this queue does not know.
    pub async fn state(&self, id: &MessageId) -> Option<MessageState> {
        if let Some(channel) = self.channel_of(id) {
            return channel.state(id).await;
        }

        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();
        for channel in channels {
            if let Some(state) = channel.state(id).await {
                return Some(state);
            }
        }
        None
    }

    async fn load_journals(&self, metadata: Option<Metadata>) -> Result<(), PersistError> {
        let mut specs: Vec<ChannelSpec> = metadata
            .map(|metadata| {
                metadata
                    .channels
                    .into_iter()
                    .map(|channel| ChannelSpec::new(channel.topic, channel.name))
                    .collect()
            })
            .unwrap_or_default();

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(PersistError::io(&self.root))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(PersistError::io(&self.root))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            if let Some(name) = file_name.strip_suffix(".journal")
                && is_valid_channel_name(name)
                && !specs.iter().any(|spec| spec.name == name)
            {
                internal!(
                    level = WARN,
                    "Found journal for channel {name} missing from metadata, restoring it under topic {}",
                    self.config.default_topic
                );
                specs.push(ChannelSpec::new(self.config.default_topic.clone(), name));
            }
        }

        for spec in &specs {
            match self.open_channel(spec).await {
                Ok(_) => {}
                Err(QueueError::Persist(err)) => return Err(err),
                Err(err) => {
                    internal!(level = WARN, "Skipping channel {} from metadata: {err}", spec.name);
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DurableQueue for Queue {
    #[tracing::instrument(level = "debug", skip(self, envelope, payload), fields(size = payload.len()))]
    async fn enqueue(
        &self,
        channel: &str,
        envelope: Envelope,
        payload: Vec<u8>,
    ) -> Result<MessageId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let target = self.channel_or_create(channel).await?;
        let id = self
            .ids
            .lock()
            .generate()
            .map_or_else(|_| MessageId::generate(), MessageId::new);
        let message = Message::new(id, channel.to_string(), envelope, payload.into(), now_ms());

        target.enqueue(message, &self.config).await?;
        self.index.insert(id, channel.to_string());

        internal!(level = DEBUG, "Queued message {id} on {channel}");
        Ok(id)
    }

    async fn pull(&self, channel: &str) -> Result<Message, QueueError> {
        let source = self.channel_or_create(channel).await?;

        loop {
            let notified = source.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pull(channel).await? {
                return Ok(message);
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn try_pull(&self, channel: &str) -> Result<Option<Message>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let source = self.channel_or_create(channel).await?;
        let mut dead = Vec::new();
        let pulled = source.try_pull(&self.config, now_ms(), &mut dead).await;
        self.report_dead(dead).await;

        Ok(pulled?)
    }

    async fn ack(&self, id: &MessageId) -> Result<(), QueueError> {
        let Some(channel) = self.channel_of(id) else {
            return Ok(());
        };

        if channel.ack(id, &self.config).await? {
            self.index.remove(id);
            internal!(level = DEBUG, "Message {id} on {} done", channel.name());
        }

        Ok(())
    }

    async fn requeue(&self, lease: &Lease, delay: Duration) -> Result<RequeueOutcome, QueueError> {
        let Some(channel) = self.channel_of(&lease.id) else {
            return Ok(RequeueOutcome::Stale);
        };

        let mut dead = Vec::new();
        let outcome = channel
            .requeue(lease, millis(delay), &self.config, now_ms(), &mut dead)
            .await;
        self.report_dead(dead).await;

        let outcome = outcome?;
        match outcome {
            RequeueOutcome::Done => {
                self.index.remove(&lease.id);
            }
            RequeueOutcome::Requeued => {
                internal!(
                    level = DEBUG,
                    "Message {} on {} requeued after attempt {}, visible in {delay:?}",
                    lease.id,
                    channel.name(),
                    lease.attempts
                );
            }
            RequeueOutcome::DeadLettered | RequeueOutcome::Stale => {}
        }

        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        reason: DeadLetterReason,
    ) -> Result<RequeueOutcome, QueueError> {
        let Some(channel) = self.channel_of(&lease.id) else {
            return Ok(RequeueOutcome::Stale);
        };

        let mut dead = Vec::new();
        let outcome = channel
            .dead_letter(lease, reason, &self.config, &mut dead)
            .await;
        self.report_dead(dead).await;

        Ok(outcome?)
    }

    async fn persist_metadata(&self) -> Result<(), PersistError> {
        let channels: Vec<Arc<Channel>> = self.channels.read().values().cloned().collect();

        let mut snapshot = Metadata::default();
        for channel in channels {
            snapshot.channels.push(channel.metadata().await);
        }
        snapshot.channels.sort_by(|a, b| a.name.cmp(&b.name));

        metadata::store(&self.root, &snapshot).await?;
        internal!(
            level = DEBUG,
            "Persisted queue metadata for {} channels",
            snapshot.channels.len()
        );
        Ok(())
    }

    async fn load_metadata(&self) -> Result<(), PersistError> {
        let snapshot = metadata::load(&self.root).await?;
        self.load_journals(snapshot).await?;

        internal!(
            level = INFO,
            "Queue metadata loaded, channels: {:?}",
            self.channel_names()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("a@example.org".into(), vec!["b@example.net".into()])
    }

    async fn queue(dir: &Path) -> Queue {
        Queue::open(dir, QueueConfig::default(), true).await.unwrap()
    }

    #[tokio::test]
    async fn closed_queue_refuses_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path()).await;

        let id = queue
            .enqueue("delivery", envelope(), b"hello".to_vec())
            .await
            .unwrap();
        let message = queue.pull("delivery").await.unwrap();
        assert_eq!(message.id, id);

        queue.close();
        assert!(matches!(
            queue.enqueue("delivery", envelope(), b"late".to_vec()).await,
            Err(QueueError::Closed)
        ));
        assert!(matches!(queue.pull("delivery").await, Err(QueueError::Closed)));

        queue.ack(&id).await.unwrap();
        assert_eq!(queue.state(&id).await, Some(MessageState::Done));
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path()).await;

        let err = queue
            .enqueue("../etc", envelope(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidChannel(_)));
    }

    #[tokio::test]
    async fn ensure_channel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path()).await;

        let spec = ChannelSpec::new("outbound", "delivery");
        queue.ensure_channel(&spec).await.unwrap();
        queue.ensure_channel(&spec).await.unwrap();

        assert_eq!(queue.channel_specs(), vec![spec]);
    }

    #[tokio::test]
    async fn unknown_ids_are_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let queue = queue(dir.path()).await;
        let id = MessageId::generate();

        queue.ack(&id).await.unwrap();
        assert_eq!(queue.state(&id).await, None);

        let lease = Lease { id, attempts: 1 };
        assert_eq!(
            queue.requeue(&lease, Duration::ZERO).await.unwrap(),
            RequeueOutcome::Stale
        );
    }
}
