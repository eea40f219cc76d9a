use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::metrics_consts::{
    SOURCE_BATCH_COLLECTION_DURATION_MS, SOURCE_BATCH_FILL_RATIO, SOURCE_KAFKA_ERROR,
};
use crate::record::{CommitBatch, ConsumedRecord};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("record stream closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("commit timed out after {0:?}")]
    Timeout(Duration),
    #[error("commit task failed: {0}")]
    Task(String),
}

/// Where the consumer loop gets its records from and reports progress to.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Wait for the next batch. Transient broker errors are retried in here; an error
    /// coming out is one the consumer cannot recover from. An empty batch is fine.
    async fn poll(&self) -> Result<Vec<ConsumedRecord>, PollError>;

    /// Commit the batch as a unit, giving up after `timeout`.
    async fn commit(&self, batch: &CommitBatch, timeout: Duration) -> Result<(), CommitError>;

    /// Check the brokers are reachable.
    async fn ping(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// Kafka consumer configuration builder. Offsets are only ever committed explicitly, so
/// both automatic commit and automatic offset store are always off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000")
            .set("statistics.interval.ms", "10000");

        Self { config }
    }

    pub fn from_config(common: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self::new(&common.kafka_hosts, &consumer.kafka_consumer_group)
            .with_tls(common.kafka_tls)
            .with_offset_reset(&consumer.kafka_consumer_offset_reset)
            .with_session_timeout_ms(consumer.kafka_consumer_session_timeout_ms)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, offset_reset: &str) -> Self {
        self.config.set("auto.offset.reset", offset_reset);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

pub struct SourceContext;

impl ClientContext for SourceContext {}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// [`RecordSource`] over an rdkafka consumer group.
pub struct KafkaRecordSource {
    consumer: Arc<StreamConsumer<SourceContext>>,
    batch_size: usize,
    batch_linger: Duration,
}

impl KafkaRecordSource {
    pub fn new(
        config: &ClientConfig,
        topics: &[&str],
        batch_size: usize,
        batch_linger: Duration,
    ) -> anyhow::Result<Self> {
        let consumer: StreamConsumer<SourceContext> = config
            .create_with_context(SourceContext)
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(topics)
            .with_context(|| format!("Failed to subscribe to topics: {topics:?}"))?;
        info!(?topics, "subscribed to kafka topics");

        Ok(Self {
            consumer: Arc::new(consumer),
            batch_size: batch_size.max(1),
            batch_linger,
        })
    }

    pub fn from_config(common: &KafkaConfig, consumer: &ConsumerConfig) -> anyhow::Result<Self> {
        let client_config = ConsumerConfigBuilder::from_config(common, consumer).build();
        Self::new(
            &client_config,
            &consumer.topics(),
            consumer.kafka_consumer_batch_size,
            consumer.batch_linger(),
        )
    }

    fn to_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
        let record = ConsumedRecord::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.payload().unwrap_or_default(),
        );
        match message.key() {
            Some(key) => record.with_key(key),
            None => record,
        }
    }
}

/// What the poll loop does with an error coming out of `recv`.
#[derive(Debug, PartialEq, Eq)]
enum RecvOutcome {
    /// The subscription is gone, surface the error.
    Fatal(&'static str),
    /// Count it, wait `backoff`, receive again.
    Retry {
        kind: &'static str,
        backoff: Duration,
    },
}

const RECV_BACKOFF_STEP: Duration = Duration::from_millis(100);
const RECV_BACKOFF_MAX_STEPS: u32 = 10;
const RECONNECT_BACKOFF_STEP: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX_STEPS: u32 = 5;

/// `attempt` counts consecutive errors, starting at 1.
fn classify_recv_error(e: &KafkaError, attempt: u32) -> RecvOutcome {
    match e {
        KafkaError::MessageConsumptionFatal(_) => RecvOutcome::Fatal("consumer"),
        KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            RecvOutcome::Fatal("authentication")
        }
        KafkaError::Canceled => RecvOutcome::Fatal("canceled"),
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => RecvOutcome::Retry {
            kind: "partition_eof",
            backoff: Duration::ZERO,
        },
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => RecvOutcome::Retry {
            kind: "broker_unreachable",
            backoff: RECONNECT_BACKOFF_STEP * attempt.min(RECONNECT_BACKOFF_MAX_STEPS),
        },
        _ => RecvOutcome::Retry {
            kind: "transient",
            backoff: RECV_BACKOFF_STEP * attempt.min(RECV_BACKOFF_MAX_STEPS),
        },
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&self) -> Result<Vec<ConsumedRecord>, PollError> {
        let start = Instant::now();
        let mut batch = Vec::with_capacity(self.batch_size);
        let linger = sleep(self.batch_linger);
        tokio::pin!(linger);
        let mut kafka_error_count: u32 = 0;

        loop {
            tokio::select! {
                // Return what we have if the batch didn't fill up in time
                _ = &mut linger => break,

                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            batch.push(Self::to_record(&message));
                            kafka_error_count = 0;
                        }
                        Err(e) => {
                            kafka_error_count += 1;
                            match classify_recv_error(&e, kafka_error_count) {
                                RecvOutcome::Fatal(kind) => {
                                    error!(kind, "fatal kafka consumer error: {e}");
                                    metrics::counter!(SOURCE_KAFKA_ERROR, "kind" => kind, "fatal" => "true")
                                        .increment(1);
                                    return Err(PollError::Kafka(e));
                                }
                                RecvOutcome::Retry { kind, backoff } => {
                                    warn!(kind, attempt = kafka_error_count, ?backoff, "kafka consumer error: {e}");
                                    metrics::counter!(SOURCE_KAFKA_ERROR, "kind" => kind, "fatal" => "false")
                                        .increment(1);
                                    sleep(backoff).await;
                                }
                            }
                        }
                    }

                    if batch.len() >= self.batch_size {
                        break;
                    }
                }
            }
        }

        metrics::histogram!(SOURCE_BATCH_COLLECTION_DURATION_MS)
            .record(start.elapsed().as_secs_f64() * 1000.0);
        if !batch.is_empty() {
            metrics::histogram!(SOURCE_BATCH_FILL_RATIO)
                .record(batch.len() as f64 / self.batch_size as f64);
        }

        Ok(batch)
    }

    async fn commit(&self, batch: &CommitBatch, timeout: Duration) -> Result<(), CommitError> {
        let offsets = batch.next_offsets();
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), next_offset) in &offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*next_offset))?;
        }

        // Synchronous commit so the caller knows the offsets are durable when this returns
        let consumer = self.consumer.clone();
        let commit = tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync));

        match tokio::time::timeout(timeout, commit).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_error)) => Err(CommitError::Task(join_error.to_string())),
            Err(_) => Err(CommitError::Timeout(timeout)),
        }
    }

    async fn ping(&self, timeout: Duration) -> anyhow::Result<()> {
        let consumer = self.consumer.clone();
        let metadata =
            tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
                .await
                .context("metadata task failed")?
                .context("failed to fetch metadata from kafka brokers")?;

        if metadata.brokers().is_empty() {
            anyhow::bail!("no kafka brokers in metadata");
        }
        Ok(())
    }
}
