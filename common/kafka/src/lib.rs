//! Kafka plumbing shared by the services: consuming with at-least-once commit semantics,
//! and producing JSON records.

pub mod config;
pub mod kafka_producer;
pub mod metrics_consts;
pub mod record;
pub mod source;
pub mod subscriber;
pub mod test;

pub use record::{CommitBatch, ConsumedRecord, RecordId};
pub use source::{CommitError, ConsumerConfigBuilder, KafkaRecordSource, PollError, RecordSource};
pub use subscriber::{ConsumerLoop, HandlerError, RecordHandler, SubscribeError};
