use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Where a record sits in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A record as polled from the broker. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    id: RecordId,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl ConsumedRecord {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: RecordId {
                topic: topic.into(),
                partition,
                offset,
            },
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.id.topic
    }

    pub fn partition(&self) -> i32 {
        self.id.partition
    }

    pub fn offset(&self) -> i64 {
        self.id.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// The key for log context, empty when the record has none.
    pub fn key_lossy(&self) -> Cow<'_, str> {
        self.key().map(String::from_utf8_lossy).unwrap_or_default()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload for log lines, lossy and truncated.
    pub fn payload_preview(&self) -> String {
        const MAX: usize = 256;
        let text = String::from_utf8_lossy(&self.payload);
        match text.char_indices().nth(MAX) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text.into_owned(),
        }
    }
}

/// Records of one poll cycle that are safe to commit, in broker order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    records: Vec<RecordId>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: RecordId) {
        self.records.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[RecordId] {
        &self.records
    }

    /// The offset to commit for each partition: one past the highest record in the batch.
    ///
    /// Kafka commits are positional, so a skipped record below a committed one on the same
    /// partition is passed over as well.
    pub fn next_offsets(&self) -> BTreeMap<(String, i32), i64> {
        let mut offsets = BTreeMap::new();
        for id in &self.records {
            let next = offsets
                .entry((id.topic.clone(), id.partition))
                .or_insert(id.offset + 1);
            *next = (*next).max(id.offset + 1);
        }
        offsets
    }
}
