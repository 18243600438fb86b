use std::collections::HashMap;
use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaProducerConfig {
    pub brokers: Vec<String>,
    /// Upper bound for the broker to acknowledge a write, enqueueing included.
    pub delivery_timeout: Duration,
    /// Extra librdkafka options, passed through untouched.
    pub raw_config: HashMap<String, String>,
}

/// Where the broker placed an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaDelivery {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: KafkaProducerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        crate::apply_raw_config(&mut client_config, &config.raw_config);
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            // every in-sync replica must have the record before the delivery report fires
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            )
            .set("client.id", "issue-relay")
            .set_log_level(RDKafkaLogLevel::Warning);

        let producer: FutureProducer =
            client_config.create().map_err(|e| Error::Connection {
                server: config.brokers.join(","),
                error: format!("Failed to create producer: {e}"),
            })?;

        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout,
        })
    }

    /// Creating a producer never talks to the brokers, this does.
    pub async fn check_connection(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        crate::blocking_with_timeout(timeout + Duration::from_secs(1), "metadata check", move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|_| ())
                .map_err(|e| Error::Kafka(format!("Fetching cluster metadata: {e}")))
        })
        .await
    }

    /// Writes one record and waits for its delivery report. Records sharing a key land on the
    /// same partition.
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<KafkaDelivery> {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).key(key).payload(payload);

        // message.timeout.ms already bounds the delivery, the outer timeout guards against a
        // delivery report that never fires.
        let delivery = tokio::time::timeout(
            self.delivery_timeout + Duration::from_secs(1),
            self.producer.send(record, self.delivery_timeout),
        )
        .await
        .map_err(|_| Error::Timeout(self.delivery_timeout))?;

        match delivery {
            Ok((partition, offset)) => {
                debug!(topic, key, partition, offset, "Record acknowledged");
                Ok(KafkaDelivery { partition, offset })
            }
            Err((e, _)) => {
                error!(?e, topic, key, "Sending record to Kafka");
                Err(Error::Kafka(format!("Sending record to {topic}: {e}")))
            }
        }
    }
}
