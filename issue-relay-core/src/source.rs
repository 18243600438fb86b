use bytes::Bytes;

/// Reading the source topic through the Kafka consumer group.
pub mod kafka;

/// One record read from the source topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
}

impl SourceRecord {
    /// The partition the record was read from.
    pub fn partition_key(&self) -> (String, i32) {
        (self.topic.clone(), self.partition)
    }
}

/// What became of a record handed back to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// The record is the next one read on its partition.
    Rewound,
    /// The partition moved to another member of the group, which reads the record again from
    /// the last commit.
    Revoked,
}

/// A consumer-group view of the source topic, one record at a time.
#[trait_variant::make(Source: Send)]
pub trait LocalSource {
    /// The next record, or `None` when nothing arrived within the read timeout or the reader
    /// is shutting down.
    async fn recv(&mut self) -> crate::Result<Option<SourceRecord>>;

    /// Moves the group's cursor past `record`.
    async fn commit(&mut self, record: &SourceRecord) -> crate::Result<()>;

    /// Makes `record` the next one read on its partition again.
    async fn redeliver(&mut self, record: &SourceRecord) -> crate::Result<Redelivery>;
}
