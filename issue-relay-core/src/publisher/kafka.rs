use bytes::Bytes;
use issue_relay_kafka::KafkaProducer;

use crate::error::{Error, Result};
use crate::publisher::{Ack, Publisher};

/// Publisher backed by the acks=all producer.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: KafkaProducer,
}

impl KafkaPublisher {
    pub fn new(producer: KafkaProducer) -> Self {
        KafkaPublisher { producer }
    }
}

impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, value: Bytes) -> Result<Ack> {
        // broker errors and delivery timeouts are all transport failures to the caller
        let delivery = self
            .producer
            .send(topic, key, &value)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Ack {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }
}
