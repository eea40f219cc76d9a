// ==== Consumer loop ====
/// Counter for records polled from the broker
pub const CONSUMER_RECORDS_POLLED: &str = "kafka_consumer_records_polled_total";

/// Counter for handled records, labelled by topic and outcome
pub const CONSUMER_RECORDS_HANDLED: &str = "kafka_consumer_records_handled_total";

/// Histogram for handler duration in seconds
pub const CONSUMER_HANDLER_DURATION: &str = "kafka_consumer_handler_duration_seconds";

/// Histogram for the number of records in a committed batch
pub const CONSUMER_COMMIT_BATCH_SIZE: &str = "kafka_consumer_commit_batch_size";

/// Counter for commits, labelled by outcome
pub const CONSUMER_COMMITS: &str = "kafka_consumer_commits_total";

/// Gauge for the unix timestamp of the last poll that returned records
pub const CONSUMER_LAST_POLLED_AT: &str = "kafka_consumer_last_polled_timestamp_seconds";

// ==== Record source ====
/// Counter for broker errors seen while polling, labelled by kind and whether it was fatal
pub const SOURCE_KAFKA_ERROR: &str = "kafka_source_error_total";

/// Histogram for time spent collecting one batch, in milliseconds
pub const SOURCE_BATCH_COLLECTION_DURATION_MS: &str = "kafka_source_batch_collection_duration_ms";

/// Histogram for how full a polled batch was relative to the configured size
pub const SOURCE_BATCH_FILL_RATIO: &str = "kafka_source_batch_fill_ratio";

// ==== Producer ====
/// Gauge for the producer queue depth reported by librdkafka
pub const PRODUCER_QUEUE_DEPTH: &str = "kafka_producer_queue_depth";

/// Gauge for the producer queue depth limit
pub const PRODUCER_QUEUE_DEPTH_LIMIT: &str = "kafka_producer_queue_depth_limit";

/// Gauge for the number of requests waiting on a broker
pub const BROKER_REQUESTS_PENDING: &str = "kafka_broker_requests_pending";
