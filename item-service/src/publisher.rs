use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::{flush_producer, send_json_to_kafka, KafkaContext};
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;

use crate::item::{Item, ItemPublisher};

/// Publishes created items as JSON, keyed by item ID so updates to one item stay ordered.
pub struct KafkaItemPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaItemPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        flush_producer(&self.producer, timeout)
    }
}

#[async_trait]
impl ItemPublisher for KafkaItemPublisher {
    async fn publish(&self, item: &Item) -> anyhow::Result<()> {
        let key = item.id.to_string();
        send_json_to_kafka(&self.producer, &self.topic, Some(&key), item).await?;
        Ok(())
    }
}
