use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // Comma separated, every topic needs a handler registered on the consumer loop
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "100")]
    pub kafka_consumer_batch_size: usize,

    // How long a poll waits for the batch to fill up before returning what it has
    #[envconfig(default = "500")]
    pub kafka_consumer_batch_linger_ms: u64,

    #[envconfig(default = "5000")]
    pub kafka_consumer_commit_timeout_ms: u64,

    #[envconfig(default = "3000")]
    pub kafka_consumer_handler_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub kafka_consumer_session_timeout_ms: u32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }

    pub fn topics(&self) -> Vec<&str> {
        self.kafka_consumer_topic
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .collect()
    }

    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_batch_linger_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_commit_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_handler_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn topics_are_split_and_trimmed() {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_owned(), "item-service".to_owned()),
            (
                "KAFKA_CONSUMER_TOPIC".to_owned(),
                "item_create, item_update,,".to_owned(),
            ),
        ]);
        let config = ConsumerConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.topics(), vec!["item_create", "item_update"]);
        assert_eq!(config.kafka_consumer_batch_size, 100);
        assert_eq!(config.commit_timeout(), Duration::from_secs(5));
        assert_eq!(config.handler_timeout(), Duration::from_secs(3));
    }
}
