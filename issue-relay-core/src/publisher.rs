use bytes::Bytes;
use tracing::warn;

use crate::message::Item;

/// Publishing through the Kafka producer.
pub mod kafka;

/// Where the broker stored an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Appends records to a topic. A returned [Ack] means the broker acknowledged the write.
#[trait_variant::make(Publisher: Send)]
pub trait LocalPublisher {
    async fn publish(&self, topic: &str, key: &str, value: Bytes) -> crate::Result<Ack>;
}

/// Outcome of publishing one item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResult {
    pub id: i64,
    pub result: crate::Result<Ack>,
}

/// Publishes every item keyed by its id, in order, carrying on past failures. One result per
/// input item.
pub async fn publish_items<P: Publisher>(
    publisher: &P,
    topic: &str,
    items: &[Item],
) -> Vec<PublishResult> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let result = match item.encode() {
            Ok(value) => publisher.publish(topic, &item.key(), value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(id = item.id, topic, error = %e, kind = e.kind(), "Failed to publish item");
        }
        results.push(PublishResult {
            id: item.id,
            result,
        });
    }
    results
}
