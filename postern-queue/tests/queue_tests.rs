#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use postern_common::{Signal, envelope::Envelope};
use postern_queue::{
    ChannelSpec, DeadLetterReason, DeadLetterSink, DurableQueue, Message, MessageState,
    PersistError, Queue, QueueConfig, RequeueOutcome, RetryCeilingPolicy,
};
use pretty_assertions::assert_eq;
use tokio::{sync::broadcast, task::JoinHandle};

const CHANNEL: &str = "delivery";

fn envelope(to: &str) -> Envelope {
    Envelope::new("sender@example.org".to_string(), vec![to.to_string()])
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        msg_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(50),
        ..QueueConfig::default()
    }
}

async fn open(dir: &Path, config: QueueConfig) -> Arc<Queue> {
    let queue = Queue::open(dir, config, true).await.unwrap();
    queue.load_metadata().await.unwrap();
    queue
        .ensure_channel(&ChannelSpec::new("outbound", CHANNEL))
        .await
        .unwrap();
    Arc::new(queue)
}

fn serve(queue: &Arc<Queue>) -> (broadcast::Sender<Signal>, JoinHandle<()>) {
    let (sender, receiver) = broadcast::channel(4);
    let handle = tokio::spawn(Arc::clone(queue).serve(receiver));
    (sender, handle)
}

async fn pull_within(queue: &Queue, limit: Duration) -> Message {
    tokio::time::timeout(limit, queue.pull(CHANNEL))
        .await
        .expect("no message became ready in time")
        .unwrap()
}

#[derive(Default)]
struct CollectingSink {
    seen: Mutex<Vec<(Message, DeadLetterReason)>>,
}

#[async_trait]
impl DeadLetterSink for CollectingSink {
    async fn dead_lettered(&self, message: &Message, reason: &DeadLetterReason) {
        self.seen.lock().push((message.clone(), reason.clone()));
    }
}

#[tokio::test]
async fn delivered_message_leaves_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), QueueConfig::default()).await;

    let id = queue
        .enqueue(CHANNEL, envelope("m1@example.net"), b"M1".to_vec())
        .await
        .unwrap();
    assert_eq!(queue.depth(CHANNEL).await, 1);
    assert_eq!(queue.state(&id).await, Some(MessageState::Ready));

    let message = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.attempts, 1);
    assert_eq!(message.state, MessageState::InFlight);
    assert_eq!(&*message.payload, b"M1");
    assert_eq!(queue.in_flight(CHANNEL).await, 1);

    queue.ack(&id).await.unwrap();
    assert_eq!(queue.depth(CHANNEL).await, 0);
    assert_eq!(queue.in_flight(CHANNEL).await, 0);
    assert_eq!(queue.state(&id).await, Some(MessageState::Done));

    // Acking again is a no-op.
    queue.ack(&id).await.unwrap();
    assert!(queue.try_pull(CHANNEL).await.unwrap().is_none());
}

#[tokio::test]
async fn requeued_message_goes_to_the_back() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), QueueConfig::default()).await;

    let first = queue
        .enqueue(CHANNEL, envelope("a@example.net"), b"1".to_vec())
        .await
        .unwrap();
    let second = queue
        .enqueue(CHANNEL, envelope("b@example.net"), b"2".to_vec())
        .await
        .unwrap();

    let pulled = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(pulled.id, first);
    assert_eq!(
        queue.requeue(&pulled.lease(), Duration::ZERO).await.unwrap(),
        RequeueOutcome::Requeued
    );

    let next = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(next.id, second);

    let retried = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(retried.id, first);
    assert_eq!(retried.attempts, 2);
    assert!(retried.retry_started_at.is_some());
}

#[tokio::test]
async fn delayed_requeue_is_invisible_until_due() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), fast_config()).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("a@example.net"), b"x".to_vec())
        .await
        .unwrap();
    let pulled = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    queue
        .requeue(&pulled.lease(), Duration::from_millis(150))
        .await
        .unwrap();

    assert!(queue.try_pull(CHANNEL).await.unwrap().is_none());
    assert_eq!(queue.depth(CHANNEL).await, 1);

    let again = pull_within(&queue, Duration::from_secs(2)).await;
    assert_eq!(again.id, id);

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn missed_deadline_is_recovered_by_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), fast_config()).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m2@example.net"), b"M2".to_vec())
        .await
        .unwrap();

    let abandoned = pull_within(&queue, Duration::from_secs(1)).await;
    assert_eq!(abandoned.attempts, 1);

    let recovered = pull_within(&queue, Duration::from_secs(2)).await;
    assert_eq!(recovered.id, id);
    assert_eq!(recovered.attempts, 2);

    // The first holder lost its claim.
    assert_eq!(
        queue
            .requeue(&abandoned.lease(), Duration::ZERO)
            .await
            .unwrap(),
        RequeueOutcome::Stale
    );
    assert_eq!(
        queue
            .dead_letter(&abandoned.lease(), DeadLetterReason::Permanent("late".into()))
            .await
            .unwrap(),
        RequeueOutcome::Stale
    );

    queue.ack(&recovered.id).await.unwrap();
    assert_eq!(queue.state(&id).await, Some(MessageState::Done));

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn late_ack_from_a_recovered_holder_completes_the_message() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), fast_config()).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();

    let abandoned = pull_within(&queue, Duration::from_secs(1)).await;
    let current = pull_within(&queue, Duration::from_secs(2)).await;
    assert_eq!(current.attempts, 2);

    queue.ack(&abandoned.id).await.unwrap();
    assert_eq!(queue.state(&id).await, Some(MessageState::Done));

    assert_eq!(
        queue
            .requeue(&current.lease(), Duration::ZERO)
            .await
            .unwrap(),
        RequeueOutcome::Stale
    );
    assert_eq!(queue.depth(CHANNEL).await, 0);

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn concurrent_pullers_never_share_a_message() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), fast_config()).await;

    let mut expected = HashSet::new();
    for n in 0..40 {
        let id = queue
            .enqueue(CHANNEL, envelope("x@example.net"), vec![n])
            .await
            .unwrap();
        expected.insert(id);
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(message) = queue.try_pull(CHANNEL).await.unwrap() {
                claimed.push(message.id);
                queue.ack(&message.id).await.unwrap();
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "message {id} was claimed twice");
        }
    }

    assert_eq!(seen, expected);
    assert_eq!(queue.depth(CHANNEL).await, 0);
}

#[tokio::test]
async fn retry_window_boundary_is_accepted_and_exceeding_it_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let config = QueueConfig {
        max_req_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let queue = Queue::open(dir.path(), config, true)
        .await
        .unwrap()
        .with_sink(sink.clone());
    let queue = Arc::new(queue);
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();

    // The window opens at the first requeue, so a delay equal to the window
    // lands exactly on the boundary.
    let first = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(
        queue
            .requeue(&first.lease(), Duration::from_millis(200))
            .await
            .unwrap(),
        RequeueOutcome::Requeued
    );

    let second = pull_within(&queue, Duration::from_secs(2)).await;
    assert_eq!(second.id, id);
    assert_eq!(
        queue
            .requeue(&second.lease(), Duration::from_millis(1))
            .await
            .unwrap(),
        RequeueOutcome::DeadLettered
    );

    assert_eq!(queue.state(&id).await, Some(MessageState::DeadLettered));
    assert_eq!(queue.depth(CHANNEL).await, 0);

    let dead = queue.dead_letters(CHANNEL).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].dead_letter, Some(DeadLetterReason::RetryCeiling));

    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.id, id);
    assert_eq!(seen[0].1, DeadLetterReason::RetryCeiling);

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn done_policy_drops_message_at_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        max_req_timeout: Duration::ZERO,
        retry_ceiling: RetryCeilingPolicy::Done,
        ..fast_config()
    };
    let queue = open(dir.path(), config).await;

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();
    let pulled = queue.try_pull(CHANNEL).await.unwrap().unwrap();

    assert_eq!(
        queue
            .requeue(&pulled.lease(), Duration::from_millis(1))
            .await
            .unwrap(),
        RequeueOutcome::Done
    );
    assert_eq!(queue.state(&id).await, Some(MessageState::Done));
    assert!(queue.dead_letters(CHANNEL).await.is_empty());
}

#[tokio::test]
async fn timed_out_retry_past_the_window_is_not_revived() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        max_req_timeout: Duration::from_millis(100),
        msg_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let queue = open(dir.path(), config).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();

    let first = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(
        queue.requeue(&first.lease(), Duration::ZERO).await.unwrap(),
        RequeueOutcome::Requeued
    );

    // The retry attempt is abandoned and its deadline lands after the window.
    let second = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(second.attempts, 2);
    tokio::time::sleep(Duration::from_millis(450)).await;

    assert_eq!(queue.state(&id).await, Some(MessageState::DeadLettered));
    assert!(queue.try_pull(CHANNEL).await.unwrap().is_none());

    let dead = queue.dead_letters(CHANNEL).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].dead_letter, Some(DeadLetterReason::RetryCeiling));
    assert_eq!(
        queue.requeue(&second.lease(), Duration::ZERO).await.unwrap(),
        RequeueOutcome::Stale
    );

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn done_policy_applies_when_the_sweep_finds_the_window_closed() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        max_req_timeout: Duration::from_millis(100),
        msg_timeout: Duration::from_millis(300),
        retry_ceiling: RetryCeilingPolicy::Done,
        ..fast_config()
    };
    let queue = open(dir.path(), config).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();

    let first = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    queue.requeue(&first.lease(), Duration::ZERO).await.unwrap();
    queue.try_pull(CHANNEL).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    assert_eq!(queue.state(&id).await, Some(MessageState::Done));
    assert_eq!(queue.depth(CHANNEL).await, 0);
    assert!(queue.dead_letters(CHANNEL).await.is_empty());

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn requeue_past_lifetime_expires() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        max_msg_timeout: Duration::from_secs(1),
        ..fast_config()
    };
    let queue = open(dir.path(), config).await;

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();
    let pulled = queue.try_pull(CHANNEL).await.unwrap().unwrap();

    assert_eq!(
        queue
            .requeue(&pulled.lease(), Duration::from_secs(5))
            .await
            .unwrap(),
        RequeueOutcome::DeadLettered
    );

    let dead = queue.dead_letters(CHANNEL).await;
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].dead_letter, Some(DeadLetterReason::Expired));
}

#[tokio::test]
async fn sweep_expires_messages_nobody_pulls() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        msg_timeout: Duration::from_millis(100),
        max_msg_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let queue = open(dir.path(), config).await;
    let (shutdown, service) = serve(&queue);

    let id = queue
        .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(queue.state(&id).await, Some(MessageState::DeadLettered));
    assert_eq!(queue.depth(CHANNEL).await, 0);

    shutdown.send(Signal::Shutdown).unwrap();
    service.await.unwrap();
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open(dir.path(), QueueConfig::default()).await;

    let id = queue
        .enqueue(CHANNEL, envelope("nobody@example.net"), b"x".to_vec())
        .await
        .unwrap();
    let pulled = queue.try_pull(CHANNEL).await.unwrap().unwrap();

    let reason = DeadLetterReason::Permanent("550 5.1.1 no such user".into());
    assert_eq!(
        queue.dead_letter(&pulled.lease(), reason.clone()).await.unwrap(),
        RequeueOutcome::DeadLettered
    );

    // Ack after dead-lettering does not resurrect or remove it.
    queue.ack(&id).await.unwrap();
    let dead = queue.dead_letters(CHANNEL).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].dead_letter, Some(reason));
    assert!(queue.try_pull(CHANNEL).await.unwrap().is_none());
}

#[tokio::test]
async fn synchronous_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (ids, claimed) = {
        let queue = open(dir.path(), QueueConfig::default()).await;
        let mut ids = Vec::new();
        for n in 0..3u8 {
            ids.push(
                queue
                    .enqueue(CHANNEL, envelope("r@example.net"), vec![n])
                    .await
                    .unwrap(),
            );
        }

        let claimed = queue.try_pull(CHANNEL).await.unwrap().unwrap();
        (ids, claimed)
        // Dropped without close, persist or flush.
    };

    let queue = open(dir.path(), QueueConfig::default()).await;
    assert_eq!(queue.depth(CHANNEL).await, 3);
    assert_eq!(queue.in_flight(CHANNEL).await, 0);

    let mut order = Vec::new();
    while let Some(message) = queue.try_pull(CHANNEL).await.unwrap() {
        if message.id == claimed.id {
            assert_eq!(message.attempts, 2);
        }
        order.push(message.id);
    }
    assert_eq!(order, ids);
}

#[tokio::test]
async fn buffered_message_is_durable_after_shutdown_flush() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        mem_queue_size: 100,
        ..QueueConfig::default()
    };

    let id = {
        let queue = open(dir.path(), config.clone()).await;
        let id = queue
            .enqueue(CHANNEL, envelope("m4@example.net"), b"M4".to_vec())
            .await
            .unwrap();
        assert!(queue.has_pending().await);

        queue.close();
        queue.persist_metadata().await.unwrap();
        queue.flush().await.unwrap();
        assert!(!queue.has_pending().await);
        id
    };

    let queue = open(dir.path(), config).await;
    let message = queue.try_pull(CHANNEL).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(&*message.payload, b"M4");
}

#[tokio::test]
async fn buffered_message_without_flush_is_lost() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        mem_queue_size: 100,
        ..QueueConfig::default()
    };

    {
        let queue = open(dir.path(), config.clone()).await;
        queue
            .enqueue(CHANNEL, envelope("m@example.net"), b"x".to_vec())
            .await
            .unwrap();
    }

    let queue = open(dir.path(), config).await;
    assert_eq!(queue.depth(CHANNEL).await, 0);
}

#[tokio::test]
async fn buffer_threshold_forces_a_flush() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        mem_queue_size: 2,
        ..QueueConfig::default()
    };

    {
        let queue = open(dir.path(), config.clone()).await;
        for n in 0..2u8 {
            queue
                .enqueue(CHANNEL, envelope("m@example.net"), vec![n])
                .await
                .unwrap();
        }
        assert!(!queue.has_pending().await);
    }

    let queue = open(dir.path(), config).await;
    assert_eq!(queue.depth(CHANNEL).await, 2);
}

#[tokio::test]
async fn metadata_restores_channels_and_topics() {
    let dir = tempfile::tempdir().unwrap();

    {
        let queue = open(dir.path(), QueueConfig::default()).await;
        queue
            .ensure_channel(&ChannelSpec::new("bulk", "newsletters"))
            .await
            .unwrap();
        queue.persist_metadata().await.unwrap();
    }

    let queue = Queue::open(dir.path(), QueueConfig::default(), false)
        .await
        .unwrap();
    queue.load_metadata().await.unwrap();
    queue.load_metadata().await.unwrap();

    assert_eq!(
        queue.channel_specs(),
        vec![
            ChannelSpec::new("outbound", "delivery"),
            ChannelSpec::new("bulk", "newsletters"),
        ]
    );
}

#[tokio::test]
async fn orphan_journal_is_restored() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let queue = open(dir.path(), QueueConfig::default()).await;
        queue
            .enqueue("stray", envelope("m@example.net"), b"x".to_vec())
            .await
            .unwrap()
        // No metadata persisted.
    };

    let queue = Queue::open(dir.path(), QueueConfig::default(), false)
        .await
        .unwrap();
    queue.load_metadata().await.unwrap();

    assert!(queue.channel_names().contains(&"stray".to_string()));
    assert_eq!(queue.state(&id).await, Some(MessageState::Ready));
}

#[tokio::test]
async fn uninitialised_storage_is_refused_without_auto_create() {
    let dir = tempfile::tempdir().unwrap();

    let err = Queue::open(dir.path().join("queue"), QueueConfig::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::SchemaMissing(_)));
}

#[tokio::test]
async fn compaction_keeps_live_messages() {
    let dir = tempfile::tempdir().unwrap();
    let config = QueueConfig {
        compact_threshold: 4,
        ..QueueConfig::default()
    };

    let survivor = {
        let queue = open(dir.path(), config.clone()).await;
        let survivor = queue
            .enqueue(CHANNEL, envelope("keep@example.net"), b"keep".to_vec())
            .await
            .unwrap();

        for n in 0..10u8 {
            let id = queue
                .enqueue(CHANNEL, envelope("m@example.net"), vec![n])
                .await
                .unwrap();
            queue.ack(&id).await.unwrap();
        }
        survivor
    };

    let journal = dir.path().join(format!("{CHANNEL}.journal"));
    let size = std::fs::metadata(&journal).unwrap().len();
    assert!(size < 1024, "journal was not compacted ({size} bytes)");

    let queue = open(dir.path(), config).await;
    assert_eq!(queue.depth(CHANNEL).await, 1);
    assert_eq!(queue.state(&survivor).await, Some(MessageState::Ready));
}
