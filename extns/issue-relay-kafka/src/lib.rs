//! Thin wrapper over [rdkafka] exposing the two things the relay needs from the broker: a
//! consumer-group reader that hands out one record at a time and commits explicitly, and a
//! producer whose send only returns once the broker acknowledged the write.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::ClientConfig;
use tracing::info;

pub mod consumer;
pub mod producer;

pub use consumer::{KafkaConsumer, KafkaConsumerConfig, KafkaOffset, KafkaRecord, SeekOutcome};
pub use producer::{KafkaDelivery, KafkaProducer, KafkaProducerConfig};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Timed out after {0:?} waiting for the broker")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Applies any supported librdkafka option, e.g. `security.protocol` or `sasl.*`, from
/// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
pub(crate) fn apply_raw_config(client_config: &mut ClientConfig, raw: &HashMap<String, String>) {
    if raw.is_empty() {
        return;
    }
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();
    // values may carry secrets, only the keys are logged
    info!(keys = ?keys, "Applying user-specified kafka config");
    for (key, value) in raw {
        client_config.set(key, value);
    }
}

/// Runs a blocking librdkafka call on the blocking pool and stops waiting for it after
/// `timeout`. A call that overruns keeps going in the background, its result is dropped.
pub(crate) async fn blocking_with_timeout<T, F>(
    timeout: Duration,
    what: &'static str,
    f: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(joined) => joined.map_err(|e| Error::Other(format!("Waiting for {what}: {e:?}")))?,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{KafkaProducer, KafkaProducerConfig};

    #[test]
    fn raw_config_is_applied() {
        let mut client_config = ClientConfig::new();
        let raw = HashMap::from([
            ("security.protocol".to_string(), "SASL_SSL".to_string()),
            ("sasl.mechanisms".to_string(), "PLAIN".to_string()),
        ]);
        apply_raw_config(&mut client_config, &raw);
        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("sasl.mechanisms"), Some("PLAIN"));
    }

    #[tokio::test]
    async fn blocking_call_is_bounded() {
        let result = blocking_with_timeout(Duration::from_millis(50), "commit", || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(t)) if t == Duration::from_millis(50)));

        let result = blocking_with_timeout(Duration::from_secs(5), "commit", || Ok(7)).await;
        assert!(matches!(result, Ok(7)));

        let result: Result<()> = blocking_with_timeout(Duration::from_secs(5), "commit", || {
            Err(Error::Kafka("coordinator not available".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Kafka(_))));
    }

    #[tokio::test]
    async fn check_connection_fails_without_broker() {
        // nothing listens on port 1, creating the producer still succeeds
        let producer = KafkaProducer::new(KafkaProducerConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            delivery_timeout: Duration::from_millis(500),
            raw_config: HashMap::new(),
        })
        .unwrap();
        assert!(producer.check_connection().await.is_err());
    }
}
