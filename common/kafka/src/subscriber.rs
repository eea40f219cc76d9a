use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{
    CONSUMER_COMMITS, CONSUMER_COMMIT_BATCH_SIZE, CONSUMER_HANDLER_DURATION,
    CONSUMER_LAST_POLLED_AT, CONSUMER_RECORDS_HANDLED, CONSUMER_RECORDS_POLLED,
};
use crate::record::{CommitBatch, ConsumedRecord};
use crate::source::{PollError, RecordSource};

/// Why a handler did not process a record.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The record was processed before, e.g. redelivered after a failed commit. Counts as
    /// handled and gets committed.
    #[error("record already exists")]
    AlreadyExists,
    /// The payload could not be decoded. Retrying will not help.
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("handler failed: {0:#}")]
    Failed(#[from] anyhow::Error),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Malformed(e.to_string())
    }
}

/// Processes the payload of every record polled from one topic.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("polling failed: {0}")]
    Poll(#[from] PollError),
    #[error("no record handler registered")]
    NoHandlers,
}

/// Polls records, hands each one to the handler registered for its topic, and commits
/// only the ones that were handled.
///
/// A record gets committed when its handler returned `Ok` or [`HandlerError::AlreadyExists`].
/// Anything else is logged and left out of the commit, and never stops the records after
/// it. Each poll cycle ends with at most one commit.
pub struct ConsumerLoop {
    source: Arc<dyn RecordSource>,
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
    handler_timeout: Duration,
    commit_timeout: Duration,
    first_polled_at: OnceLock<SystemTime>,
    last_polled_at: Mutex<Option<SystemTime>>,
}

/// Handler outcome, wrapped in the panic guard, wrapped in the timeout.
type HandlerResult =
    Result<std::thread::Result<Result<(), HandlerError>>, tokio::time::error::Elapsed>;

enum Outcome {
    Handled,
    Duplicate,
    Skipped,
}

impl ConsumerLoop {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            handlers: HashMap::new(),
            handler_timeout: Duration::from_secs(3),
            commit_timeout: Duration::from_secs(5),
            first_polled_at: OnceLock::new(),
            last_polled_at: Mutex::new(None),
        }
    }

    pub fn with_handler(mut self, topic: impl Into<String>, handler: Arc<dyn RecordHandler>) -> Self {
        self.register(topic, handler);
        self
    }

    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn RecordHandler>) {
        let topic = topic.into();
        if self.handlers.insert(topic.clone(), handler).is_some() {
            warn!(topic = %topic, "replacing record handler");
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    pub fn first_polled_at(&self) -> Option<SystemTime> {
        self.first_polled_at.get().copied()
    }

    pub fn last_polled_at(&self) -> Option<SystemTime> {
        *self
            .last_polled_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run until `shutdown` is cancelled or the source fails for good.
    ///
    /// On cancellation in the middle of a batch, whatever was handled so far is committed
    /// before returning.
    pub async fn subscribe(&self, shutdown: CancellationToken) -> Result<(), SubscribeError> {
        if self.handlers.is_empty() {
            return Err(SubscribeError::NoHandlers);
        }
        info!(topics = ?self.topics(), "starting consumer loop");

        loop {
            let records = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.source.poll() => match polled {
                    Ok(records) => records,
                    Err(e) => {
                        error!("consumer loop stopping on poll error: {e}");
                        return Err(e.into());
                    }
                },
            };
            self.mark_polled(records.len());

            if records.is_empty() {
                continue;
            }

            let (batch, interrupted) = self.handle_batch(&records, &shutdown).await;
            self.commit(&batch).await;

            if interrupted {
                break;
            }
        }

        info!("consumer loop stopped");
        Ok(())
    }

    fn mark_polled(&self, count: usize) {
        let now = SystemTime::now();
        if self.first_polled_at.set(now).is_ok() {
            debug!("first successful poll");
        }
        *self
            .last_polled_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now);

        metrics::counter!(CONSUMER_RECORDS_POLLED).increment(count as u64);
        if let Ok(since_epoch) = now.duration_since(UNIX_EPOCH) {
            metrics::gauge!(CONSUMER_LAST_POLLED_AT).set(since_epoch.as_secs_f64());
        }
    }

    /// Returns the committable records and whether shutdown cut the batch short.
    async fn handle_batch(
        &self,
        records: &[ConsumedRecord],
        shutdown: &CancellationToken,
    ) -> (CommitBatch, bool) {
        let mut batch = CommitBatch::new();

        for record in records {
            if shutdown.is_cancelled() {
                return (batch, true);
            }

            let Some(handler) = self.handlers.get(record.topic()) else {
                debug!(record = %record.id(), "no handler for topic, ignoring record");
                continue;
            };

            let started = Instant::now();
            let handled = AssertUnwindSafe(handler.handle(record.payload())).catch_unwind();
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(record = %record.id(), "shutdown while handling record, it will be redelivered");
                    return (batch, true);
                }
                result = tokio::time::timeout(self.handler_timeout, handled) => result,
            };

            let outcome = self.classify(record, result);
            let label = match outcome {
                Outcome::Handled => "success",
                Outcome::Duplicate => "duplicate",
                Outcome::Skipped => "skipped",
            };
            metrics::counter!(CONSUMER_RECORDS_HANDLED, "topic" => record.topic().to_owned(), "outcome" => label)
                .increment(1);
            metrics::histogram!(CONSUMER_HANDLER_DURATION, "topic" => record.topic().to_owned())
                .record(started.elapsed().as_secs_f64());

            match outcome {
                Outcome::Handled | Outcome::Duplicate => batch.push(record.id().clone()),
                Outcome::Skipped => {}
            }
        }

        (batch, false)
    }

    fn classify(&self, record: &ConsumedRecord, result: HandlerResult) -> Outcome {
        let key = record.key_lossy();
        match result {
            Ok(Ok(Ok(()))) => Outcome::Handled,
            Ok(Ok(Err(HandlerError::AlreadyExists))) => {
                info!(record = %record.id(), "record already exists, committing");
                Outcome::Duplicate
            }
            Ok(Ok(Err(HandlerError::Malformed(reason)))) => {
                warn!(
                    record = %record.id(),
                    %key,
                    payload = %record.payload_preview(),
                    "skipping malformed record: {reason}"
                );
                Outcome::Skipped
            }
            Ok(Ok(Err(e))) => {
                error!(
                    record = %record.id(),
                    %key,
                    payload = %record.payload_preview(),
                    "failed to handle record: {e}"
                );
                Outcome::Skipped
            }
            Ok(Err(_)) => {
                error!(
                    record = %record.id(),
                    %key,
                    payload = %record.payload_preview(),
                    "record handler panicked"
                );
                Outcome::Skipped
            }
            Err(_) => {
                error!(
                    record = %record.id(),
                    %key,
                    payload = %record.payload_preview(),
                    timeout = ?self.handler_timeout,
                    "record handler timed out"
                );
                Outcome::Skipped
            }
        }
    }

    async fn commit(&self, batch: &CommitBatch) {
        if batch.is_empty() {
            return;
        }

        metrics::histogram!(CONSUMER_COMMIT_BATCH_SIZE).record(batch.len() as f64);
        match self.source.commit(batch, self.commit_timeout).await {
            Ok(()) => {
                metrics::counter!(CONSUMER_COMMITS, "outcome" => "success").increment(1);
                debug!(records = batch.len(), "committed batch");
            }
            Err(e) => {
                metrics::counter!(CONSUMER_COMMITS, "outcome" => "failure").increment(1);
                error!(records = batch.len(), "failed to commit batch: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::record::RecordId;
    use crate::source::CommitError;

    const TOPIC: &str = "item_create";

    /// Serves the scripted polls in order, then reports itself drained and pends.
    #[derive(Default)]
    struct MockSource {
        polls: Mutex<VecDeque<Result<Vec<ConsumedRecord>, PollError>>>,
        commits: Mutex<Vec<CommitBatch>>,
        failing_commits: AtomicUsize,
        drained: CancellationToken,
    }

    impl MockSource {
        fn new(polls: Vec<Result<Vec<ConsumedRecord>, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            })
        }

        fn committed_offsets(&self) -> Vec<Vec<i64>> {
            self.commits
                .lock()
                .unwrap()
                .iter()
                .map(|batch| batch.records().iter().map(|id| id.offset).collect())
                .collect()
        }
    }

    #[async_trait]
    impl RecordSource for MockSource {
        async fn poll(&self) -> Result<Vec<ConsumedRecord>, PollError> {
            let next = self.polls.lock().unwrap().pop_front();
            match next {
                Some(polled) => polled,
                None => {
                    self.drained.cancel();
                    std::future::pending().await
                }
            }
        }

        async fn commit(&self, batch: &CommitBatch, _timeout: Duration) -> Result<(), CommitError> {
            assert!(!batch.is_empty(), "commit called with an empty batch");
            self.commits.lock().unwrap().push(batch.clone());
            if self.failing_commits.load(Ordering::SeqCst) > 0 {
                self.failing_commits.fetch_sub(1, Ordering::SeqCst);
                return Err(CommitError::Timeout(Duration::from_secs(5)));
            }
            Ok(())
        }

        async fn ping(&self, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Behaves according to the payload it gets.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
        blocked: Notify,
    }

    #[async_trait]
    impl RecordHandler for ScriptedHandler {
        async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
            let payload = String::from_utf8_lossy(payload).into_owned();
            self.seen.lock().unwrap().push(payload.clone());
            match payload.as_str() {
                "ok" => Ok(()),
                "dup" => Err(HandlerError::AlreadyExists),
                "bad" => Err(serde_json::from_str::<u32>("{").unwrap_err().into()),
                "fail" => Err(anyhow::anyhow!("store unavailable").into()),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                "block" => {
                    self.blocked.notify_one();
                    std::future::pending().await
                }
                other => panic!("unexpected payload {other}"),
            }
        }
    }

    fn record(offset: i64, payload: &str) -> ConsumedRecord {
        ConsumedRecord::new(TOPIC, 0, offset, payload.as_bytes().to_vec())
    }

    fn consumer(source: Arc<MockSource>, handler: Arc<ScriptedHandler>) -> Arc<ConsumerLoop> {
        Arc::new(
            ConsumerLoop::new(source)
                .with_handler(TOPIC, handler)
                .with_handler_timeout(Duration::from_secs(1)),
        )
    }

    /// Runs the loop until the source has nothing left, then shuts it down.
    async fn run_until_drained(
        consumer: Arc<ConsumerLoop>,
        source: &MockSource,
    ) -> Result<(), SubscribeError> {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move { consumer.subscribe(token).await });

        source.drained.cancelled().await;
        shutdown.cancel();
        running.await.unwrap()
    }

    #[tokio::test]
    async fn commits_only_handled_records() {
        let source = MockSource::new(vec![Ok(vec![
            record(1, "ok"),
            record(2, "fail"),
            record(3, "ok"),
        ])]);
        let handler = Arc::new(ScriptedHandler::default());

        run_until_drained(consumer(source.clone(), handler.clone()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![1, 3]]);
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_batch() {
        let source = MockSource::new(vec![
            Ok(vec![record(1, "ok"), record(2, "panic-me"), record(3, "ok")]),
            Ok(vec![record(4, "ok")]),
        ]);
        let handler = Arc::new(ScriptedHandler::default());

        run_until_drained(consumer(source.clone(), handler.clone()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![1, 3], vec![4]]);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec!["ok", "panic-me", "ok", "ok"]
        );
    }

    #[tokio::test]
    async fn duplicates_are_committed_malformed_are_not() {
        let source = MockSource::new(vec![Ok(vec![
            record(10, "dup"),
            record(11, "bad"),
            record(12, "ok"),
            record(13, "bad"),
        ])]);

        run_until_drained(consumer(source.clone(), Default::default()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![10, 12]]);
    }

    #[tokio::test]
    async fn never_commits_an_empty_batch() {
        let source = MockSource::new(vec![
            Ok(vec![]),
            Ok(vec![record(1, "fail"), record(2, "bad")]),
            Ok(vec![record(3, "ok")]),
        ]);

        run_until_drained(consumer(source.clone(), Default::default()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![3]]);
    }

    #[tokio::test]
    async fn records_without_handler_are_ignored() {
        let source = MockSource::new(vec![Ok(vec![
            ConsumedRecord::new("item_delete", 0, 1, b"ok".to_vec()),
            record(2, "ok"),
        ])]);
        let handler = Arc::new(ScriptedHandler::default());

        run_until_drained(consumer(source.clone(), handler.clone()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![2]]);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn commit_failure_does_not_stop_the_loop() {
        let source = MockSource::new(vec![
            Ok(vec![record(1, "ok")]),
            Ok(vec![record(2, "ok")]),
        ]);
        source.failing_commits.store(1, Ordering::SeqCst);

        run_until_drained(consumer(source.clone(), Default::default()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn poll_error_ends_the_loop() {
        let source = MockSource::new(vec![Ok(vec![record(1, "ok")]), Err(PollError::Closed)]);
        let consumer = consumer(source.clone(), Default::default());

        let result = consumer.subscribe(CancellationToken::new()).await;

        assert!(matches!(result, Err(SubscribeError::Poll(PollError::Closed))));
        assert_eq!(source.committed_offsets(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_is_skipped() {
        let source = MockSource::new(vec![Ok(vec![
            record(1, "slow"),
            record(2, "ok"),
        ])]);

        run_until_drained(consumer(source.clone(), Default::default()), &source)
            .await
            .unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![2]]);
    }

    #[tokio::test]
    async fn shutdown_mid_batch_commits_what_was_handled() {
        let source = MockSource::new(vec![Ok(vec![
            record(1, "ok"),
            record(2, "block"),
            record(3, "ok"),
        ])]);
        let handler = Arc::new(ScriptedHandler::default());
        let consumer = consumer(source.clone(), handler.clone());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move { consumer.subscribe(token).await });

        handler.blocked.notified().await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(source.committed_offsets(), vec![vec![1]]);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["ok", "block"]);
    }

    #[tokio::test]
    async fn refuses_to_run_without_handlers() {
        let source = MockSource::new(vec![]);
        let consumer = ConsumerLoop::new(source);

        let result = consumer.subscribe(CancellationToken::new()).await;
        assert!(matches!(result, Err(SubscribeError::NoHandlers)));
    }

    #[tokio::test]
    async fn tracks_poll_timestamps() {
        let source = MockSource::new(vec![Ok(vec![record(1, "ok")]), Ok(vec![])]);
        let consumer = consumer(source.clone(), Default::default());
        assert!(consumer.first_polled_at().is_none());

        run_until_drained(consumer.clone(), &source).await.unwrap();

        let first = consumer.first_polled_at().unwrap();
        let last = consumer.last_polled_at().unwrap();
        assert!(last >= first);
    }

    #[test]
    fn commit_batch_keeps_broker_order() {
        let mut batch = CommitBatch::new();
        for offset in [5, 3, 9] {
            batch.push(RecordId {
                topic: TOPIC.to_owned(),
                partition: 0,
                offset,
            });
        }
        let offsets: Vec<i64> = batch.records().iter().map(|id| id.offset).collect();
        assert_eq!(offsets, vec![5, 3, 9]);
    }
}
