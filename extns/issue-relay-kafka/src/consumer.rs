use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConsumerConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume records from.
    pub topic: String,
    /// Consumer group shared by every relay instance reading the topic.
    pub consumer_group: String,
    /// How long a single receive waits before reporting that nothing arrived.
    pub read_timeout: Duration,
    /// Extra librdkafka options, passed through untouched.
    pub raw_config: HashMap<String, String>,
}

/// A record received from Kafka.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// Empty when the record carried no payload.
    pub value: Bytes,
    /// Milliseconds since epoch, if the broker reported one.
    pub timestamp: Option<i64>,
}

impl KafkaRecord {
    pub fn offset(&self) -> KafkaOffset {
        KafkaOffset {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Result of rewinding a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The record is the next one read on its partition.
    Rewound,
    /// The partition was revoked from this consumer. Whoever owns it now resumes from the last
    /// committed offset, the record included.
    NotAssigned,
}

/// Position of a record within a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

// Callbacks executed by librdkafka, only used for logging.
struct RelayConsumerContext;

impl ClientContext for RelayConsumerContext {}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Pre rebalance");
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(?rebalance, "Post rebalance");
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!(?result, "Committed offsets");
    }
}

type RelayStreamConsumer = StreamConsumer<RelayConsumerContext>;

enum ConsumerActorMessage {
    Recv {
        respond_to: oneshot::Sender<Result<Option<KafkaRecord>>>,
    },
    Commit {
        offset: KafkaOffset,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seek {
        offset: KafkaOffset,
        respond_to: oneshot::Sender<Result<SeekOutcome>>,
    },
}

struct ConsumerActor {
    consumer: Arc<RelayStreamConsumer>,
    read_timeout: Duration,
    handler_rx: mpsc::Receiver<ConsumerActorMessage>,
    cancel_token: CancellationToken,
}

impl ConsumerActor {
    async fn start(
        config: KafkaConsumerConfig,
        handler_rx: mpsc::Receiver<ConsumerActorMessage>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        crate::apply_raw_config(&mut client_config, &config.raw_config);
        // commits are driven by the relay, never by librdkafka
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<RelayStreamConsumer> = Arc::new(
            client_config
                .create_with_context(RelayConsumerContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        // subscribe() succeeds even when the brokers are unreachable, fetching metadata does not.
        let metadata_consumer = Arc::clone(&consumer);
        let topic = config.topic.clone();
        tokio::task::spawn_blocking(move || {
            metadata_consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for metadata check: {e:?}")))?
        .map_err(|err| Error::Connection {
            server: config.brokers.join(","),
            error: err.to_string(),
        })?;

        let actor = ConsumerActor {
            consumer,
            read_timeout: config.read_timeout,
            handler_rx,
            cancel_token,
        };

        tokio::spawn(async move {
            info!(topic = config.topic, "Starting Kafka consumer");
            // returns once every handle is dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
        info!("Kafka consumer stopped");
    }

    async fn handle_message(&mut self, msg: ConsumerActorMessage) {
        match msg {
            ConsumerActorMessage::Recv { respond_to } => {
                let record = self.recv().await;
                if respond_to.send(record).is_err() {
                    error!("Receiver of the Kafka record went away");
                }
            }
            ConsumerActorMessage::Commit { offset, respond_to } => {
                let status = self.commit(offset).await;
                if respond_to.send(status).is_err() {
                    error!("Receiver of the commit status went away");
                }
            }
            ConsumerActorMessage::Seek { offset, respond_to } => {
                let status = self.seek(offset).await;
                if respond_to.send(status).is_err() {
                    error!("Receiver of the seek status went away");
                }
            }
        }
    }

    /// Waits for the next record, returns None on read timeout or cancellation.
    async fn recv(&mut self) -> Result<Option<KafkaRecord>> {
        if self.cancel_token.is_cancelled() {
            return Ok(None);
        }

        let message = tokio::select! {
            biased;

            _ = self.cancel_token.cancelled() => return Ok(None),
            _ = tokio::time::sleep(self.read_timeout) => return Ok(None),
            message = self.consumer.recv() => message,
        };

        let message = message.map_err(|e| Error::Kafka(format!("Failed to read record: {e}")))?;

        let record = KafkaRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).to_string()),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            timestamp: message.timestamp().to_millis(),
        };
        debug!(
            partition = record.partition,
            offset = record.offset,
            "Read record from Kafka"
        );
        Ok(Some(record))
    }

    async fn commit(&mut self, offset: KafkaOffset) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // The committed offset is the position of the next record to read.
        tpl.add_partition_offset(
            &offset.topic,
            offset.partition,
            Offset::Offset(offset.offset + 1),
        )
        .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;

        // a synchronous commit blocks on the broker round trip, and for as long as the group
        // coordinator is unavailable
        let consumer = Arc::clone(&self.consumer);
        crate::blocking_with_timeout(COMMIT_TIMEOUT, "commit", move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
    }

    async fn seek(&mut self, offset: KafkaOffset) -> Result<SeekOutcome> {
        let consumer = Arc::clone(&self.consumer);
        crate::blocking_with_timeout(SEEK_TIMEOUT + Duration::from_secs(1), "seek", move || {
            if !is_assigned(&consumer, &offset)? {
                info!(?offset, "Partition is no longer assigned, not seeking");
                return Ok(SeekOutcome::NotAssigned);
            }
            match consumer.seek(
                &offset.topic,
                offset.partition,
                Offset::Offset(offset.offset),
                SEEK_TIMEOUT,
            ) {
                Ok(()) => Ok(SeekOutcome::Rewound),
                // a rebalance may revoke the partition while seeking
                Err(e) if !is_assigned(&consumer, &offset).unwrap_or(true) => {
                    info!(?e, ?offset, "Partition was revoked while seeking");
                    Ok(SeekOutcome::NotAssigned)
                }
                Err(e) => {
                    warn!(?e, ?offset, "Seeking back to a record");
                    Err(Error::Kafka(format!("Failed to seek: {e}")))
                }
            }
        })
        .await
    }
}

fn is_assigned(consumer: &RelayStreamConsumer, offset: &KafkaOffset) -> Result<bool> {
    let assignment = consumer
        .assignment()
        .map_err(|e| Error::Kafka(format!("Failed to read partition assignment: {e}")))?;
    Ok(assignment
        .find_partition(&offset.topic, offset.partition)
        .is_some())
}

/// Handle to the consumer actor, reading one record at a time and committing explicitly.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<ConsumerActorMessage>,
}

impl KafkaConsumer {
    /// Connects, subscribes and verifies the brokers are reachable. Fails with
    /// [Error::Connection] otherwise.
    pub async fn connect(
        config: KafkaConsumerConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        ConsumerActor::start(config, rx, cancel_token).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Next record for this consumer group. None means nothing arrived within the read timeout
    /// or the consumer was cancelled.
    pub async fn recv(&self) -> Result<Option<KafkaRecord>> {
        let (tx, rx) = oneshot::channel();
        self.send(ConsumerActorMessage::Recv { respond_to: tx }).await?;
        rx.await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))?
    }

    /// Commits the consumer group past `offset`.
    pub async fn commit(&self, offset: KafkaOffset) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ConsumerActorMessage::Commit {
            offset,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))?
    }

    /// Rewinds the partition so that `offset` is delivered again, unless the partition is no
    /// longer assigned to this consumer.
    pub async fn seek(&self, offset: KafkaOffset) -> Result<SeekOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(ConsumerActorMessage::Seek {
            offset,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))?
    }

    async fn send(&self, msg: ConsumerActorMessage) -> Result<()> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))
    }
}
