use issue_relay_kafka::{KafkaConsumer, KafkaOffset, KafkaRecord, SeekOutcome};

use crate::error::Result;
use crate::source::{Redelivery, Source, SourceRecord};

impl From<KafkaRecord> for SourceRecord {
    fn from(record: KafkaRecord) -> Self {
        SourceRecord {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            value: record.value,
        }
    }
}

fn kafka_offset(record: &SourceRecord) -> KafkaOffset {
    KafkaOffset {
        topic: record.topic.clone(),
        partition: record.partition,
        offset: record.offset,
    }
}

impl Source for KafkaConsumer {
    async fn recv(&mut self) -> Result<Option<SourceRecord>> {
        Ok(KafkaConsumer::recv(self).await?.map(SourceRecord::from))
    }

    async fn commit(&mut self, record: &SourceRecord) -> Result<()> {
        Ok(KafkaConsumer::commit(self, kafka_offset(record)).await?)
    }

    async fn redeliver(&mut self, record: &SourceRecord) -> Result<Redelivery> {
        Ok(match self.seek(kafka_offset(record)).await? {
            SeekOutcome::Rewound => Redelivery::Rewound,
            SeekOutcome::NotAssigned => Redelivery::Revoked,
        })
    }
}
