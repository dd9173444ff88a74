//! One channel: its journal plus the ready, delayed and in-flight indices.
//!
//! Every transition is journalled before the in-memory state changes, all
//! under the channel's lock, so one message never has two in-flight holders.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::Path,
    sync::Arc,
};

use postern_common::internal;
use tokio::sync::{Mutex, Notify};

use crate::{
    config::{ChannelSpec, QueueConfig, RetryCeilingPolicy},
    error::PersistError,
    journal::{Journal, Record},
    message::{DeadLetterReason, Lease, Message, MessageState, within_retry_window},
    metadata::ChannelMetadata,
    types::{MessageId, millis},
};

/// Acked IDs remembered so [`Channel::state`] can still answer `Done`.
const DONE_HISTORY: usize = 1024;

/// Result of resolving a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Ready again, once the delay has passed.
    Requeued,
    /// Moved to the dead-letter set.
    DeadLettered,
    /// Removed as done under [`RetryCeilingPolicy::Done`].
    Done,
    /// The lease no longer names the current holder; nothing changed.
    Stale,
}

pub struct Channel {
    topic: String,
    name: String,
    state: Mutex<ChannelState>,
    notify: Notify,
}

struct ChannelState {
    journal: Journal,
    messages: HashMap<MessageId, Message>,
    ready: VecDeque<MessageId>,
    delayed: BTreeMap<(u64, u64), MessageId>,
    /// In-flight messages and their visibility deadline.
    in_flight: HashMap<MessageId, u64>,
    dead: usize,
    done: VecDeque<MessageId>,
    seq: u64,
}

/// Fold journal records into the message set they describe.
fn replay(records: Vec<Record>) -> HashMap<MessageId, Message> {
    let mut messages = HashMap::new();

    for record in records {
        match record {
            Record::Put(message) => {
                messages.insert(message.id, message);
            }
            Record::Claim {
                id,
                attempts,
                deadline,
            } => {
                if let Some(message) = messages.get_mut(&id) {
                    message.attempts = attempts;
                    message.state = MessageState::InFlight;
                    message.deadline = Some(deadline);
                }
            }
            Record::Release {
                id,
                visible_at,
                retry_started_at,
            } => {
                if let Some(message) = messages.get_mut(&id) {
                    message.state = MessageState::Ready;
                    message.visible_at = visible_at;
                    message.retry_started_at = retry_started_at;
                    message.deadline = None;
                }
            }
            Record::Ack { id } => {
                messages.remove(&id);
            }
            Record::DeadLetter { id, reason } => {
                if let Some(message) = messages.get_mut(&id) {
                    message.state = MessageState::DeadLettered;
                    message.dead_letter = Some(reason);
                    message.deadline = None;
                }
            }
        }
    }

    messages
}

impl Channel {
    /// Open the channel's journal under `root` and rebuild its state.
    ///
    /// Messages that were in flight when the journal was last written are
    /// ready again.
    ///
    /// # Errors
    /// If the journal cannot be opened or compacted
    pub async fn open(
        root: &Path,
        spec: &ChannelSpec,
        config: &QueueConfig,
        now: u64,
    ) -> Result<Arc<Self>, PersistError> {
        let (mut journal, records) =
            Journal::open(Journal::path_for(root, &spec.name), config.log_journal).await?;
        let record_count = records.len();
        let mut messages = replay(records);

        let mut live: Vec<&mut Message> = messages
            .values_mut()
            .filter(|message| message.state != MessageState::DeadLettered)
            .collect();
        live.sort_by_key(|message| (message.visible_at, message.id));

        let mut ready = VecDeque::new();
        let mut delayed = BTreeMap::new();
        let mut seq = 0;
        let mut recovered = 0;

        for message in live {
            if message.state == MessageState::InFlight {
                message.state = MessageState::Ready;
                message.deadline = None;
                recovered += 1;
            }

            if message.visible_at <= now {
                ready.push_back(message.id);
            } else {
                delayed.insert((message.visible_at, seq), message.id);
                seq += 1;
            }
        }

        let dead = messages
            .values()
            .filter(|message| message.state == MessageState::DeadLettered)
            .count();

        if record_count > messages.len() {
            let mut retained: Vec<&Message> = messages.values().collect();
            retained.sort_by_key(|message| message.id);
            journal.rewrite(retained.into_iter()).await?;
        }

        internal!(
            level = INFO,
            "Channel {}/{} loaded: {} ready, {} delayed, {recovered} recovered from in-flight, {dead} dead-lettered",
            spec.topic,
            spec.name,
            ready.len(),
            delayed.len()
        );

        Ok(Arc::new(Self {
            topic: spec.topic.clone(),
            name: spec.name.clone(),
            state: Mutex::new(ChannelState {
                journal,
                messages,
                ready,
                delayed,
                in_flight: HashMap::new(),
                dead,
                done: VecDeque::new(),
                seq,
            }),
            notify: Notify::new(),
        }))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn notify(&self) -> &Notify {
        &self.notify
    }

    /// IDs of every message held, for the queue's ID index.
    pub async fn ids(&self) -> Vec<MessageId> {
        self.state.lock().await.messages.keys().copied().collect()
    }

    /// Journal `message` and make it ready.
    ///
    /// # Errors
    /// If the write cannot be made durable when required; nothing is queued
    pub async fn enqueue(&self, message: Message, config: &QueueConfig) -> Result<(), PersistError> {
        let mut state = self.state.lock().await;
        let mark = state.journal.mark();
        state.journal.append(&Record::Put(message.clone()))?;

        if (config.is_synchronous() || state.journal.pending_puts() >= config.mem_queue_size)
            && let Err(err) = state.journal.commit().await
        {
            state.journal.discard_from(mark);
            return Err(err);
        }

        state.ready.push_back(message.id);
        state.messages.insert(message.id, message);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim the oldest ready message.
    ///
    /// Messages found past their lifetime are dead-lettered on the way and
    /// pushed onto `dead`.
    ///
    /// # Errors
    /// If the claim cannot be journalled; the message stays ready
    pub async fn try_pull(
        &self,
        config: &QueueConfig,
        now: u64,
        dead: &mut Vec<Message>,
    ) -> Result<Option<Message>, PersistError> {
        let mut state = self.state.lock().await;
        let sync = config.is_synchronous();
        let lifetime = millis(config.max_msg_timeout);

        while let Some(id) = state.ready.pop_front() {
            let Some(message) = state.messages.get(&id) else {
                continue;
            };

            if message.state != MessageState::Ready {
                continue;
            }

            if message.expired_at(now, lifetime) {
                match state.dead_letter(id, DeadLetterReason::Expired, sync).await {
                    Ok(message) => dead.extend(message),
                    Err(err) => {
                        state.ready.push_front(id);
                        return Err(err);
                    }
                }
                continue;
            }

            let attempts = message.attempts.saturating_add(1);
            let deadline = now
                .saturating_add(millis(config.msg_timeout))
                .min(message.enqueued_at.saturating_add(lifetime));

            let claim = Record::Claim {
                id,
                attempts,
                deadline,
            };
            if let Err(err) = state.record(&claim, sync).await {
                state.ready.push_front(id);
                return Err(err);
            }

            state.in_flight.insert(id, deadline);
            if let Some(message) = state.messages.get_mut(&id) {
                message.attempts = attempts;
                message.state = MessageState::InFlight;
                message.deadline = Some(deadline);
                return Ok(Some(message.clone()));
            }
        }

        Ok(None)
    }

    /// Remove a delivered message. Returns whether anything was removed.
    ///
    /// # Errors
    /// If the ack cannot be journalled; the message is kept
    pub async fn ack(
        &self,
        id: &MessageId,
        config: &QueueConfig,
    ) -> Result<bool, PersistError> {
        let mut state = self.state.lock().await;

        match state.messages.get(id) {
            Some(message) if message.state != MessageState::DeadLettered => {}
            _ => return Ok(false),
        }

        state.record(&Record::Ack { id: *id }, config.is_synchronous()).await?;
        state.remove_done(id);
        state.compact_if_needed(config).await;
        Ok(true)
    }

    /// Return a leased message to the ready set after `delay`, subject to
    /// the lifetime and retry-window ceilings.
    ///
    /// # Errors
    /// If the transition cannot be journalled; the message stays in flight
    pub async fn requeue(
        &self,
        lease: &Lease,
        delay_ms: u64,
        config: &QueueConfig,
        now: u64,
        dead: &mut Vec<Message>,
    ) -> Result<RequeueOutcome, PersistError> {
        let mut state = self.state.lock().await;
        let sync = config.is_synchronous();

        let Some(message) = state.held(lease) else {
            return Ok(RequeueOutcome::Stale);
        };

        let visible_at = now.saturating_add(delay_ms);
        let started = message.retry_started_at.unwrap_or(now);

        if message.expired_at(visible_at, millis(config.max_msg_timeout)) {
            dead.extend(state.dead_letter(lease.id, DeadLetterReason::Expired, sync).await?);
            return Ok(RequeueOutcome::DeadLettered);
        }

        if !within_retry_window(started, visible_at, millis(config.max_req_timeout)) {
            return state
                .exhaust_retries(lease.id, &self.name, config, sync, dead)
                .await;
        }

        let release = Record::Release {
            id: lease.id,
            visible_at,
            retry_started_at: Some(started),
        };
        state.record(&release, sync).await?;
        state.release(lease.id, visible_at, Some(started), now);
        drop(state);

        if visible_at <= now {
            self.notify.notify_waiters();
        }

        Ok(RequeueOutcome::Requeued)
    }

    /// Dead-letter a leased message.
    ///
    /// # Errors
    /// If the transition cannot be journalled; the message stays in flight
    pub async fn dead_letter(
        &self,
        lease: &Lease,
        reason: DeadLetterReason,
        config: &QueueConfig,
        dead: &mut Vec<Message>,
    ) -> Result<RequeueOutcome, PersistError> {
        let mut state = self.state.lock().await;

        if state.held(lease).is_none() {
            return Ok(RequeueOutcome::Stale);
        }

        dead.extend(
            state
                .dead_letter(lease.id, reason, config.is_synchronous())
                .await?,
        );
        Ok(RequeueOutcome::DeadLettered)
    }

    /// Recover in-flight messages past their deadline, promote delayed
    /// messages that are due and expire messages past their lifetime.
    ///
    /// A recovered message whose retry window has closed gets the retry
    /// ceiling policy instead. IDs it removes as done are pushed onto `done`.
    ///
    /// # Errors
    /// If the resulting records cannot be synced. The transitions stay
    /// buffered and are retried on the next sweep.
    pub async fn sweep(
        &self,
        config: &QueueConfig,
        now: u64,
        dead: &mut Vec<Message>,
        done: &mut Vec<MessageId>,
    ) -> Result<(), PersistError> {
        let mut state = self.state.lock().await;
        let lifetime = millis(config.max_msg_timeout);
        let window = millis(config.max_req_timeout);
        let mut woken = 0usize;

        let overdue: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|&(_, deadline)| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            let Some(message) = state.messages.get(&id) else {
                state.in_flight.remove(&id);
                continue;
            };

            if message.expired_at(now, lifetime) {
                dead.extend(state.dead_letter(id, DeadLetterReason::Expired, false).await?);
                continue;
            }

            if message
                .retry_started_at
                .is_some_and(|started| !within_retry_window(started, now, window))
            {
                if state.exhaust_retries(id, &self.name, config, false, dead).await?
                    == RequeueOutcome::Done
                {
                    done.push(id);
                }
                continue;
            }

            internal!(
                level = WARN,
                "Message {id} on {} missed its deadline on attempt {}, making it ready again",
                self.name,
                message.attempts
            );

            let retry_started_at = message.retry_started_at;
            state.record(
                &Record::Release {
                    id,
                    visible_at: now,
                    retry_started_at,
                },
                false,
            )
            .await?;
            state.release(id, now, retry_started_at, now);
            woken += 1;
        }

        while let Some(entry) = state.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let id = entry.remove();
            if state
                .messages
                .get(&id)
                .is_some_and(|message| message.state == MessageState::Ready)
            {
                state.ready.push_back(id);
                woken += 1;
            }
        }

        let expired: Vec<MessageId> = state
            .messages
            .values()
            .filter(|message| {
                message.state == MessageState::Ready && message.expired_at(now, lifetime)
            })
            .map(|message| message.id)
            .collect();

        for id in expired {
            dead.extend(state.dead_letter(id, DeadLetterReason::Expired, false).await?);
        }

        if config.is_synchronous() {
            state.journal.commit().await?;
        }

        state.compact_if_needed(config).await;
        drop(state);

        if woken > 0 {
            self.notify.notify_waiters();
        }

        Ok(())
    }

    /// Write and sync every buffered record.
    ///
    /// # Errors
    /// If the journal cannot be synced
    pub async fn flush(&self) -> Result<(), PersistError> {
        self.state.lock().await.journal.commit().await
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.journal.has_pending()
    }

    pub async fn metadata(&self) -> ChannelMetadata {
        let state = self.state.lock().await;

        ChannelMetadata {
            topic: self.topic.clone(),
            name: self.name.clone(),
            depth: (state.messages.len() - state.dead) as u64,
            dead_letters: state.dead as u64,
            journal_records: state.journal.records() as u64,
        }
    }

    /// Messages not yet terminal.
    pub async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.messages.len() - state.dead
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        let mut dead: Vec<Message> = state
            .messages
            .values()
            .filter(|message| message.state == MessageState::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by_key(|message| message.id);
        dead
    }

    pub async fn state(&self, id: &MessageId) -> Option<MessageState> {
        let state = self.state.lock().await;

        state.messages.get(id).map_or_else(
            || state.done.contains(id).then_some(MessageState::Done),
            |message| Some(message.state),
        )
    }
}

impl ChannelState {
    /// Journal a record, syncing it when `sync` is set.
    ///
    /// A record that could not be synced is dropped from the buffer so the
    /// caller can leave its state untouched.
    async fn record(&mut self, record: &Record, sync: bool) -> Result<(), PersistError> {
        let mark = self.journal.mark();
        self.journal.append(record)?;

        if sync && let Err(err) = self.journal.commit().await {
            self.journal.discard_from(mark);
            return Err(err);
        }

        Ok(())
    }

    /// The in-flight message `lease` refers to, if the lease is current.
    fn held(&self, lease: &Lease) -> Option<&Message> {
        if !self.in_flight.contains_key(&lease.id) {
            return None;
        }

        self.messages.get(&lease.id).filter(|message| {
            message.state == MessageState::InFlight && message.attempts == lease.attempts
        })
    }

    async fn dead_letter(
        &mut self,
        id: MessageId,
        reason: DeadLetterReason,
        sync: bool,
    ) -> Result<Option<Message>, PersistError> {
        let record = Record::DeadLetter {
            id,
            reason: reason.clone(),
        };
        self.record(&record, sync).await?;
        self.in_flight.remove(&id);

        let Some(message) = self.messages.get_mut(&id) else {
            return Ok(None);
        };

        message.state = MessageState::DeadLettered;
        message.dead_letter = Some(reason);
        message.deadline = None;
        self.dead += 1;

        Ok(Some(message.clone()))
    }

    /// Apply the retry ceiling policy to a message whose retry window has
    /// closed.
    async fn exhaust_retries(
        &mut self,
        id: MessageId,
        channel: &str,
        config: &QueueConfig,
        sync: bool,
        dead: &mut Vec<Message>,
    ) -> Result<RequeueOutcome, PersistError> {
        match config.retry_ceiling {
            RetryCeilingPolicy::DeadLetter => {
                dead.extend(
                    self.dead_letter(id, DeadLetterReason::RetryCeiling, sync)
                        .await?,
                );
                Ok(RequeueOutcome::DeadLettered)
            }
            RetryCeilingPolicy::Done => {
                self.record(&Record::Ack { id }, sync).await?;
                let attempts = self.messages.get(&id).map_or(0, |message| message.attempts);
                internal!(
                    level = WARN,
                    "Message {id} on {channel} exhausted its retry window after {attempts} attempts, dropping it as done"
                );
                self.remove_done(&id);
                self.compact_if_needed(config).await;
                Ok(RequeueOutcome::Done)
            }
        }
    }

    fn release(&mut self, id: MessageId, visible_at: u64, retry_started_at: Option<u64>, now: u64) {
        self.in_flight.remove(&id);

        if let Some(message) = self.messages.get_mut(&id) {
            message.state = MessageState::Ready;
            message.visible_at = visible_at;
            message.retry_started_at = retry_started_at;
            message.deadline = None;
        }

        if visible_at <= now {
            self.ready.push_back(id);
        } else {
            self.delayed.insert((visible_at, self.seq), id);
            self.seq += 1;
        }
    }

    fn remove_done(&mut self, id: &MessageId) {
        self.messages.remove(id);
        self.in_flight.remove(id);

        if self.done.len() == DONE_HISTORY {
            self.done.pop_front();
        }
        self.done.push_back(*id);
    }

    /// Rewrite the journal once superseded records dominate it.
    async fn compact_if_needed(&mut self, config: &QueueConfig) {
        let live = self.messages.len();
        let superseded = self.journal.records().saturating_sub(live);

        if superseded <= config.compact_threshold || superseded <= live {
            return;
        }

        let mut retained: Vec<&Message> = self.messages.values().collect();
        retained.sort_by_key(|message| message.id);

        if let Err(err) = self.journal.rewrite(retained.into_iter()).await {
            internal!(
                level = ERROR,
                "Failed to compact {}: {err}",
                self.journal.path().display()
            );
        }
    }
}
