//! Consume-dispatch-commit loop
//!
//! A [`Consumer`] owns one broker subscription. Its loop pulls batches,
//! asks the [`MessageProcessor`] to classify each record and spawns a
//! tracked task per matched record, bounded by a semaphore sized to the
//! rule's concurrency. A timer flushes safe offsets and a self-check task
//! reports entries stuck longer than the staleness threshold.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::engine::offsets::OffsetTracker;
use crate::engine::{Classification, MessageProcessor};
use crate::error::{ChangepropError, Result};
use crate::kafka::{BrokerConsumer, BrokerError, Record};
use crate::metrics::{record_commit, record_commit_failure, record_message};

/// Loop tuning for one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Maximum records executing at once.
    pub concurrency: usize,
    /// Maximum records per pull.
    pub batch_size: usize,
    /// Period of the offset flush.
    pub commit_interval: Duration,
    /// Pause after an empty pull, end of partition or timeout.
    pub empty_poll_backoff: Duration,
    /// Pause after the broker reports a disconnect.
    pub disconnect_backoff: Duration,
    /// Age after which in-flight and pending entries are reported.
    pub stale_threshold: Duration,
    /// Chance that a record which matched nothing is settled for commit.
    pub unmatched_commit_probability: f64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            concurrency: 30,
            batch_size: 1,
            commit_interval: Duration::from_millis(500),
            empty_poll_backoff: Duration::from_millis(100),
            disconnect_backoff: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(60),
            unmatched_commit_probability: 0.01,
        }
    }
}

struct Shared {
    name: String,
    broker: Arc<dyn BrokerConsumer>,
    offsets: Mutex<OffsetTracker>,
    connected: AtomicBool,
}

impl Shared {
    fn offsets(&self) -> MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, record: &Record) {
        self.offsets()
            .register(&record.topic, record.partition, record.offset, Instant::now());
    }

    fn settle(&self, record: &Record) {
        self.offsets()
            .settle(&record.topic, record.partition, record.offset, Instant::now());
    }

    fn settle_sampled(&self, record: &Record, probability: f64) {
        let mut rng = rand::rng();
        self.offsets().settle_sampled(
            &record.topic,
            record.partition,
            record.offset,
            probability,
            &mut rng,
            Instant::now(),
        );
    }

    async fn flush_commits(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let commits = self.offsets().take_committable();
        for commit in commits {
            match self
                .broker
                .commit(&commit.topic, commit.partition, commit.offset)
                .await
            {
                Ok(()) => {
                    debug!(
                        consumer = %self.name,
                        topic = %commit.topic,
                        partition = commit.partition,
                        offset = commit.offset,
                        "Committed offset"
                    );
                    self.offsets().mark_committed(&commit);
                    record_commit(&self.name);
                }
                Err(e) => {
                    warn!(
                        consumer = %self.name,
                        topic = %commit.topic,
                        partition = commit.partition,
                        offset = commit.offset,
                        error = %e,
                        "Commit failed, retrying on next flush"
                    );
                    self.offsets().requeue(&commit, Instant::now());
                    record_commit_failure(&self.name);
                }
            }
        }
    }

    fn report_stale(&self, threshold: Duration) {
        for entry in self.offsets().stale(Instant::now(), threshold) {
            error!(
                consumer = %self.name,
                topic = %entry.topic,
                partition = entry.partition,
                offset = entry.offset,
                age_secs = entry.age.as_secs(),
                kind = ?entry.kind,
                "Stale offset entry"
            );
        }
    }
}

/// A consume loop bound to one processor and one subscription.
pub struct Consumer<P: MessageProcessor> {
    processor: Arc<P>,
    broker: Arc<dyn BrokerConsumer>,
    topics: Vec<String>,
    settings: ConsumerSettings,
}

impl<P: MessageProcessor> Consumer<P> {
    /// Creates a consumer; nothing runs until [`Consumer::start`].
    pub fn new(
        processor: Arc<P>,
        broker: Arc<dyn BrokerConsumer>,
        topics: Vec<String>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            processor,
            broker,
            topics,
            settings,
        }
    }

    /// Subscribes and spawns the loop, the commit timer and the self-check.
    ///
    /// # Errors
    ///
    /// Returns `ChangepropError::Broker` if the subscription fails and
    /// `ChangepropError::Config` if concurrency or batch size is zero.
    pub async fn start(self) -> Result<ConsumerHandle> {
        if self.settings.concurrency == 0 || self.settings.batch_size == 0 {
            return Err(ChangepropError::Config(
                "concurrency and batch size must be positive".to_string(),
            )
            .into());
        }
        self.broker
            .subscribe(&self.topics)
            .await
            .map_err(ChangepropError::from)?;

        let name = self.processor.name().to_string();
        info!(consumer = %name, topics = ?self.topics, concurrency = self.settings.concurrency, "Starting consumer");

        let shared = Arc::new(Shared {
            name,
            broker: self.broker,
            offsets: Mutex::new(OffsetTracker::new()),
            connected: AtomicBool::new(true),
        });
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let settings = self.settings;

        let loop_task = tokio::spawn(
            ConsumeLoop {
                processor: self.processor,
                shared: shared.clone(),
                semaphore: Arc::new(Semaphore::new(settings.concurrency)),
                settings: settings.clone(),
                cancel: cancel.clone(),
                tasks: tasks.clone(),
            }
            .run(),
        );

        let commit_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            let period = settings.commit_interval;
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => shared.flush_commits().await,
                    }
                }
            })
        };

        let check_task = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            let threshold = settings.stale_threshold;
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + threshold, threshold);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => shared.report_stale(threshold),
                    }
                }
            })
        };

        Ok(ConsumerHandle {
            shared,
            cancel,
            tasks,
            loop_task,
            timers: vec![commit_task, check_task],
        })
    }
}

struct ConsumeLoop<P: MessageProcessor> {
    processor: Arc<P>,
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    settings: ConsumerSettings,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<P: MessageProcessor> ConsumeLoop<P> {
    async fn run(self) {
        loop {
            let Some(permit) = self.acquire().await else {
                break;
            };
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pulled = self.shared.broker.pull(self.settings.batch_size) => pulled,
            };
            match pulled {
                Ok(records) if records.is_empty() => {
                    drop(permit);
                    self.pause(self.settings.empty_poll_backoff).await;
                }
                Ok(records) => {
                    let mut spare = Some(permit);
                    for record in records {
                        if !self.dispatch(record, &mut spare).await {
                            break;
                        }
                    }
                }
                Err(BrokerError::PartitionEof) | Err(BrokerError::Timeout) => {
                    drop(permit);
                    debug!(consumer = %self.shared.name, "No data, backing off");
                    self.pause(self.settings.empty_poll_backoff).await;
                }
                Err(BrokerError::Disconnected(reason)) => {
                    drop(permit);
                    if !self.shared.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(consumer = %self.shared.name, reason = %reason, "Broker disconnected, backing off");
                    self.pause(self.settings.disconnect_backoff).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(consumer = %self.shared.name, error = %e, "Broker error");
                    self.pause(self.settings.empty_poll_backoff).await;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        debug!(consumer = %self.shared.name, "Consume loop stopped");
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Handles one record; returns false when the loop is shutting down.
    async fn dispatch(&self, record: Record, spare: &mut Option<OwnedSemaphorePermit>) -> bool {
        let name = self.processor.name();
        match self.processor.classify(&record) {
            Classification::Invalid(err) => {
                record_message(name, "parse_error");
                warn!(
                    consumer = %name,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Unparseable record"
                );
                let processor = self.processor.clone();
                let invalid = record.clone();
                self.tasks.spawn(async move {
                    processor.report_invalid(&invalid, err).await;
                });
                self.shared
                    .settle_sampled(&record, self.settings.unmatched_commit_probability);
            }
            Classification::Unmatched => {
                record_message(name, "unmatched");
                self.shared
                    .settle_sampled(&record, self.settings.unmatched_commit_probability);
            }
            Classification::Matched(job) => {
                record_message(name, "matched");
                let permit = match spare.take() {
                    Some(permit) => permit,
                    None => match self.acquire().await {
                        Some(permit) => permit,
                        None => return false,
                    },
                };
                self.shared.register(&record);
                let processor = self.processor.clone();
                let shared = self.shared.clone();
                self.tasks.spawn(async move {
                    let result = AssertUnwindSafe(processor.process(job, &record))
                        .catch_unwind()
                        .await;
                    if let Err(payload) = result {
                        let message = panic_message(payload.as_ref());
                        error!(
                            consumer = %shared.name,
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            panic = %message,
                            "Record processing panicked"
                        );
                        record_message(&shared.name, "internal_error");
                        processor.report_internal(&record, message).await;
                    }
                    drop(permit);
                    shared.settle(&record);
                });
            }
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with a non-string payload".to_string())
}

/// Handle to a running [`Consumer`].
pub struct ConsumerHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    loop_task: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Label of the consumer.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Records currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.offsets().in_flight_count()
    }

    /// Returns false once closing has begun.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Flushes committable offsets immediately.
    pub async fn flush(&self) {
        self.shared.flush_commits().await;
    }

    /// Stops pulling, disconnects and waits for in-flight work to finish.
    ///
    /// Settlements after this point no longer produce commits.
    pub async fn close(self) {
        info!(consumer = %self.shared.name, "Closing consumer");
        self.shared.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Err(e) = self.loop_task.await {
            error!(consumer = %self.shared.name, error = %e, "Consume loop failed");
        }
        for timer in self.timers {
            let _ = timer.await;
        }
        self.shared.broker.disconnect().await;
        self.tasks.close();
        self.tasks.wait().await;
        info!(consumer = %self.shared.name, "Consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::{ConsumerFactory, MemoryBroker};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Matches payloads "go" and "crash"; rejects "bad" as invalid.
    struct TestProcessor {
        gate: Option<Arc<Notify>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        processed: AtomicUsize,
        invalid: AtomicUsize,
        internal: Mutex<Vec<String>>,
    }

    impl TestProcessor {
        fn new(gate: Option<Arc<Notify>>) -> Self {
            Self {
                gate,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                invalid: AtomicUsize::new(0),
                internal: Mutex::new(Vec::new()),
            }
        }

        fn internal(&self) -> Vec<String> {
            self.internal.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageProcessor for TestProcessor {
        type Job = ();

        fn name(&self) -> &str {
            "test"
        }

        fn classify(&self, record: &Record) -> Classification<()> {
            match record.value.as_deref() {
                Some(b"go") | Some(b"crash") => Classification::Matched(()),
                Some(b"bad") => Classification::Invalid(ChangepropError::Parse("bad".to_string())),
                _ => Classification::Unmatched,
            }
        }

        async fn report_invalid(&self, _record: &Record, _error: ChangepropError) {
            self.invalid.fetch_add(1, Ordering::SeqCst);
        }

        async fn report_internal(&self, _record: &Record, message: String) {
            self.internal.lock().unwrap().push(message);
        }

        async fn process(&self, _job: (), record: &Record) {
            if record.value.as_deref() == Some(b"crash") {
                panic!("processor crashed");
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(concurrency: usize, batch_size: usize) -> ConsumerSettings {
        ConsumerSettings {
            concurrency,
            batch_size,
            commit_interval: Duration::from_millis(20),
            empty_poll_backoff: Duration::from_millis(5),
            disconnect_backoff: Duration::from_millis(50),
            unmatched_commit_probability: 0.0,
            ..ConsumerSettings::default()
        }
    }

    async fn start(
        broker: &MemoryBroker,
        processor: Arc<TestProcessor>,
        settings: ConsumerSettings,
    ) -> ConsumerHandle {
        broker.create_topic("t", 1).await;
        let consumer = broker.create_consumer("g").await.unwrap();
        Consumer::new(processor, consumer, vec!["t".to_string()], settings)
            .start()
            .await
            .unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_matched_records_processed_and_committed() {
        let broker = MemoryBroker::new();
        let processor = Arc::new(TestProcessor::new(None));
        let handle = start(&broker, processor.clone(), settings(4, 2)).await;

        for _ in 0..3 {
            broker.publish("t", b"go".to_vec()).await;
        }
        wait_for(|| processor.processed.load(Ordering::SeqCst) == 3).await;
        for _ in 0..50 {
            if broker.committed("g", "t", 0).await == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.committed("g", "t", 0).await, Some(2));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(TestProcessor::new(Some(gate.clone())));
        let handle = start(&broker, processor.clone(), settings(2, 5)).await;

        for _ in 0..5 {
            broker.publish("t", b"go".to_vec()).await;
        }
        wait_for(|| processor.running.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(handle.in_flight(), 2);

        // Nothing is committable while offset 0 is executing.
        handle.flush().await;
        assert_eq!(broker.committed("g", "t", 0).await, None);

        for _ in 0..10 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if processor.processed.load(Ordering::SeqCst) == 5 {
                break;
            }
        }
        assert_eq!(processor.processed.load(Ordering::SeqCst), 5);
        assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_invalid_records_reported_without_permit() {
        let broker = MemoryBroker::new();
        let processor = Arc::new(TestProcessor::new(None));
        let handle = start(&broker, processor.clone(), settings(1, 1)).await;

        broker.publish("t", b"bad".to_vec()).await;
        broker.publish("t", b"other".to_vec()).await;
        broker.publish("t", b"go".to_vec()).await;
        wait_for(|| processor.processed.load(Ordering::SeqCst) == 1).await;
        wait_for(|| processor.invalid.load(Ordering::SeqCst) == 1).await;
        handle.close().await;
    }

    #[tokio::test]
    async fn test_panicking_record_reported_and_settled() {
        let broker = MemoryBroker::new();
        let processor = Arc::new(TestProcessor::new(None));
        let handle = start(&broker, processor.clone(), settings(1, 1)).await;

        broker.publish("t", b"crash".to_vec()).await;
        broker.publish("t", b"go".to_vec()).await;
        wait_for(|| processor.processed.load(Ordering::SeqCst) == 1).await;
        wait_for(|| processor.internal().len() == 1).await;
        assert_eq!(processor.internal(), vec!["processor crashed".to_string()]);

        for _ in 0..50 {
            if broker.committed("g", "t", 0).await == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.committed("g", "t", 0).await, Some(1));
        handle.close().await;
    }

    #[test]
    fn test_panic_message_extracted() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42u8), "panic with a non-string payload");
    }

    #[tokio::test]
    async fn test_recovers_from_broker_errors() {
        let broker = MemoryBroker::new();
        let processor = Arc::new(TestProcessor::new(None));
        broker.inject_pull_error(BrokerError::Timeout).await;
        broker
            .inject_pull_error(BrokerError::Disconnected("blip".to_string()))
            .await;
        broker.inject_pull_error(BrokerError::Other("boom".to_string())).await;
        let handle = start(&broker, processor.clone(), settings(1, 1)).await;

        broker.publish("t", b"go".to_vec()).await;
        wait_for(|| processor.processed.load(Ordering::SeqCst) == 1).await;
        handle.close().await;
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried() {
        let broker = MemoryBroker::new();
        let processor = Arc::new(TestProcessor::new(None));
        broker.fail_commits(1).await;
        let handle = start(&broker, processor.clone(), settings(1, 1)).await;

        broker.publish("t", b"go".to_vec()).await;
        wait_for(|| processor.processed.load(Ordering::SeqCst) == 1).await;
        for _ in 0..50 {
            if broker.committed("g", "t", 0).await == Some(0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.committed("g", "t", 0).await, Some(0));
        handle.close().await;
    }

    #[tokio::test]
    async fn test_no_commits_after_close() {
        let broker = MemoryBroker::new();
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(TestProcessor::new(Some(gate.clone())));
        let handle = start(&broker, processor.clone(), settings(1, 1)).await;

        broker.publish("t", b"go".to_vec()).await;
        wait_for(|| processor.running.load(Ordering::SeqCst) == 1).await;

        let closing = tokio::spawn(handle.close());
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();
        closing.await.unwrap();

        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
        assert!(broker.commits().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let broker = MemoryBroker::new();
        let consumer = broker.create_consumer("g").await.unwrap();
        let result = Consumer::new(
            Arc::new(TestProcessor::new(None)),
            consumer,
            vec!["t".to_string()],
            settings(0, 1),
        )
        .start()
        .await;
        assert!(result.is_err());
    }
}
