//! Source topic to derived topic, one record at a time. A source record is committed only once
//! its derived record was acknowledged, once it proved undecodable, or once it was moved to the
//! dead-letter topic. Anything else is handed back to the consumer so it is read again before
//! any later record of its partition.
//!
//! ```text
//! RECEIVED -> DECODED -> ENRICHED -> PUBLISHED -> COMMITTED
//!        \                  \            \
//!         (poison) COMMITTED  (failure) RETAINED | DEAD-LETTERED
//! ```

use std::collections::HashMap;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::enricher::Enricher;
use crate::error::{Error, Result};
use crate::message::Item;
use crate::metrics::{kind_labels, relay_metrics};
use crate::publisher::{Ack, Publisher};
use crate::source::{Redelivery, Source, SourceRecord};

mod dead_letter;
pub use dead_letter::DeadLetter;

const ENRICH_RETRY_BASE_MS: u64 = 200;
const ENRICH_RETRY_MAX_MS: u64 = 5_000;

/// How processing one record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The derived record was acknowledged and the source record committed.
    Committed,
    /// The payload could not be decoded, the record was committed without output.
    PoisonSkipped,
    /// Not committed, the record will be read again. Carries the error kind.
    Retained(&'static str),
    /// Written to the dead-letter topic and committed.
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTopics {
    pub derived: String,
    pub dead_letter: Option<String>,
}

/// Consumes the source topic, enriches every item and publishes the result.
pub struct TransformPipeline<S, E, P> {
    source: S,
    enricher: E,
    publisher: P,
    topics: PipelineTopics,
    config: PipelineConfig,
    // per partition, the offset held back for redelivery and its failed attempts
    attempts: HashMap<(String, i32), (i64, u32)>,
}

impl<S, E, P> TransformPipeline<S, E, P>
where
    S: Source,
    E: Enricher + Sync,
    P: Publisher + Sync,
{
    pub fn new(
        source: S,
        enricher: E,
        publisher: P,
        topics: PipelineTopics,
        config: PipelineConfig,
    ) -> Self {
        TransformPipeline {
            source,
            enricher,
            publisher,
            topics,
            config,
            attempts: HashMap::new(),
        }
    }

    /// Reads and processes records until `cancel` fires. The record in flight when that
    /// happens is finished first.
    ///
    /// Returns an error only when a failed record could not be handed back to the consumer
    /// while its partition is still ours, as carrying on would let a later commit skip over it.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(derived = %self.topics.derived, dead_letter = ?self.topics.dead_letter, "Starting transform pipeline");
        while !cancel.is_cancelled() {
            let record = match self.source.recv().await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(?e, "Reading from the source topic");
                    self.pause(&cancel).await;
                    continue;
                }
            };

            if let RecordOutcome::Retained(_) = self.process(record).await? {
                self.pause(&cancel).await;
            }
        }
        info!("Cancellation token received, transform pipeline stopped");
        Ok(())
    }

    /// Takes one record through the state machine.
    pub async fn process(&mut self, record: SourceRecord) -> Result<RecordOutcome> {
        relay_metrics().records_read.inc();

        let item = match Item::decode(&record.value) {
            Ok(item) => item,
            Err(e) => return self.skip_poison(&record, e).await,
        };

        match self.forward(&item).await {
            Ok(ack) => self.commit(&record, &item, ack).await,
            Err(e) => self.retain_or_dead_letter(&record, Some(item.id), e).await,
        }
    }

    /// ENRICHED and PUBLISHED. Transient enrichment failures are retried here.
    async fn forward(&self, item: &Item) -> Result<Ack> {
        let enricher = &self.enricher;
        let strategy = Exponential::from_millis(ENRICH_RETRY_BASE_MS, ENRICH_RETRY_MAX_MS)
            .jitter(0.1)
            .max_attempts(self.config.enrich_retries);
        let start = Instant::now();

        let enriched = Retry::new(
            strategy,
            || enricher.enrich(item),
            |e: &Error| e.is_transient(),
        )
        .notify(|e: &Error, attempt: usize, delay: Duration| {
            warn!(id = item.id, attempt, ?delay, kind = e.kind(), error = %e, "Enrichment failed, retrying");
        })
        .await;

        relay_metrics()
            .enrich_time
            .observe(start.elapsed().as_micros() as f64);

        let enriched = enriched.inspect_err(|e| {
            relay_metrics()
                .enrich_failures
                .get_or_create(&kind_labels(e.kind()))
                .inc();
        })?;
        debug_assert_eq!(enriched.id, item.id);

        let value = enriched.encode()?;
        self.publisher
            .publish(&self.topics.derived, &enriched.key(), value)
            .await
            .inspect_err(|_| {
                relay_metrics().publish_failures.inc();
            })
    }

    async fn commit(&mut self, record: &SourceRecord, item: &Item, ack: Ack) -> Result<RecordOutcome> {
        if let Err(e) = self.source.commit(record).await {
            error!(
                id = item.id,
                partition = record.partition,
                offset = record.offset,
                ?e,
                "Derived record written but the source commit failed, the record will be read again"
            );
            self.redeliver(record).await?;
            return Ok(RecordOutcome::Retained(e.kind()));
        }

        self.forget_attempts(record);
        relay_metrics().records_committed.inc();
        info!(
            id = item.id,
            partition = record.partition,
            offset = record.offset,
            derived_partition = ack.partition,
            derived_offset = ack.offset,
            "Record summarized and committed"
        );
        Ok(RecordOutcome::Committed)
    }

    async fn skip_poison(&mut self, record: &SourceRecord, e: Error) -> Result<RecordOutcome> {
        relay_metrics().poison_messages.inc();
        warn!(
            partition = record.partition,
            offset = record.offset,
            key = ?record.key,
            error = %e,
            "Skipping undecodable record"
        );
        if let Err(e) = self.source.commit(record).await {
            error!(partition = record.partition, offset = record.offset, ?e, "Committing poison record");
            self.redeliver(record).await?;
            return Ok(RecordOutcome::Retained(e.kind()));
        }
        Ok(RecordOutcome::PoisonSkipped)
    }

    async fn retain_or_dead_letter(
        &mut self,
        record: &SourceRecord,
        id: Option<i64>,
        e: Error,
    ) -> Result<RecordOutcome> {
        let attempts = {
            let held = self
                .attempts
                .entry(record.partition_key())
                .or_insert((record.offset, 0));
            if held.0 != record.offset {
                *held = (record.offset, 0);
            }
            held.1 += 1;
            held.1
        };
        error!(
            id,
            partition = record.partition,
            offset = record.offset,
            key = ?record.key,
            attempts,
            kind = e.kind(),
            error = %e,
            "Record not forwarded, leaving it uncommitted"
        );

        if let Some(topic) = self.topics.dead_letter.clone()
            && self.config.max_attempts > 0
            && attempts >= self.config.max_attempts
        {
            match self.dead_letter(&topic, record, &e, attempts).await {
                Ok(()) => return Ok(RecordOutcome::DeadLettered),
                Err(dlq_err) => {
                    error!(id, offset = record.offset, ?dlq_err, "Moving record to the dead-letter topic");
                }
            }
        }

        self.redeliver(record).await?;
        Ok(RecordOutcome::Retained(e.kind()))
    }

    async fn dead_letter(
        &mut self,
        topic: &str,
        record: &SourceRecord,
        e: &Error,
        attempts: u32,
    ) -> Result<()> {
        let letter = DeadLetter::new(record, e, attempts, Utc::now());
        let ack = self
            .publisher
            .publish(topic, &letter.key(), letter.encode()?)
            .await?;
        self.source.commit(record).await?;

        self.forget_attempts(record);
        relay_metrics().dead_lettered.inc();
        warn!(
            partition = record.partition,
            offset = record.offset,
            attempts,
            dead_letter_topic = topic,
            dead_letter_offset = ack.offset,
            "Record moved to the dead-letter topic"
        );
        Ok(())
    }

    async fn redeliver(&mut self, record: &SourceRecord) -> Result<()> {
        match self.source.redeliver(record).await {
            Ok(Redelivery::Rewound) => Ok(()),
            Ok(Redelivery::Revoked) => {
                // the new owner reads it from the last commit and counts its own attempts
                self.attempts.remove(&record.partition_key());
                info!(
                    partition = record.partition,
                    offset = record.offset,
                    "Partition was revoked, leaving the failed record to its new owner"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    ?e,
                    "Could not rewind the consumer to a failed record"
                );
                Err(e)
            }
        }
    }

    /// A commit at or past the held back offset means that record is done with.
    fn forget_attempts(&mut self, record: &SourceRecord) {
        let key = record.partition_key();
        if self
            .attempts
            .get(&key)
            .is_some_and(|(offset, _)| *offset <= record.offset)
        {
            self.attempts.remove(&key);
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.redelivery_delay) => {}
        }
    }
}
