//! In-memory stand-ins for the broker, the tracker and the summarizer. Each fake is a cheap
//! handle over shared state so a test can keep one copy for assertions after handing the other
//! to the code under test.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::enricher::Enricher;
use crate::error::{Error, Result};
use crate::fetcher::{Fetched, Fetcher};
use crate::message::{EnrichedItem, Item};
use crate::publisher::{Ack, Publisher};
use crate::source::{Redelivery, Source, SourceRecord};

pub(crate) fn item(id: i64, title: &str, body: &str) -> Item {
    Item {
        id,
        sequence_number: id + 100,
        title: title.to_string(),
        body: body.to_string(),
        url: format!("https://github.com/bootc-dev/bootc/issues/{}", id + 100),
    }
}

pub(crate) fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Collects the JSON log lines of the current thread while the guard from [LogCapture::install]
/// is alive.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn events(&self) -> Vec<serde_json::Value> {
        let buffer = self.buffer.lock();
        String::from_utf8_lossy(&buffer)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Records every write. Topics or keys can be made to fail.
#[derive(Clone, Default)]
pub(crate) struct MemoryPublisher {
    state: Arc<Mutex<PublisherState>>,
}

#[derive(Default)]
struct PublisherState {
    written: Vec<(String, String, Bytes)>,
    failing_topics: HashMap<String, Error>,
    failing_keys: HashMap<String, Error>,
}

impl MemoryPublisher {
    pub(crate) fn fail_topic(&self, topic: &str, error: Error) {
        self.state
            .lock()
            .failing_topics
            .insert(topic.to_string(), error);
    }

    pub(crate) fn fail_key(&self, key: &str, error: Error) {
        self.state.lock().failing_keys.insert(key.to_string(), error);
    }

    pub(crate) fn heal(&self) {
        let mut state = self.state.lock();
        state.failing_topics.clear();
        state.failing_keys.clear();
    }

    /// (key, value) pairs acknowledged on `topic`, in write order.
    pub(crate) fn records(&self, topic: &str) -> Vec<(String, Bytes)> {
        self.state
            .lock()
            .written
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, key: &str, value: Bytes) -> Result<Ack> {
        let mut state = self.state.lock();
        if let Some(e) = state
            .failing_topics
            .get(topic)
            .or_else(|| state.failing_keys.get(key))
        {
            return Err(e.clone());
        }
        let offset = state.written.iter().filter(|(t, _, _)| t == topic).count() as i64;
        state
            .written
            .push((topic.to_string(), key.to_string(), value));
        Ok(Ack {
            partition: 0,
            offset,
        })
    }
}

/// A single-partition topic with a consumer-group cursor.
#[derive(Clone)]
pub(crate) struct MemorySource {
    state: Arc<Mutex<SourceState>>,
    drained: Option<CancellationToken>,
}

#[derive(Default)]
struct SourceState {
    records: Vec<SourceRecord>,
    cursor: usize,
    committed: Vec<i64>,
    redelivered: Vec<i64>,
    failing_commit: Option<Error>,
    revoked: bool,
}

impl MemorySource {
    pub(crate) fn new(topic: &str, values: Vec<(Option<&str>, Bytes)>) -> Self {
        let records = values
            .into_iter()
            .enumerate()
            .map(|(offset, (key, value))| SourceRecord {
                topic: topic.to_string(),
                partition: 0,
                offset: offset as i64,
                key: key.map(str::to_string),
                value,
            })
            .collect();
        MemorySource {
            state: Arc::new(Mutex::new(SourceState {
                records,
                ..Default::default()
            })),
            drained: None,
        }
    }

    pub(crate) fn with_items(topic: &str, items: &[Item]) -> Self {
        let values = items
            .iter()
            .map(|i| (None, i.encode().unwrap()))
            .collect::<Vec<_>>();
        let source = Self::new(topic, values);
        {
            let mut state = source.state.lock();
            for (record, item) in state.records.iter_mut().zip(items) {
                record.key = Some(item.key());
            }
        }
        source
    }

    /// Cancels `token` once every record was read and nothing is pending redelivery.
    pub(crate) fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.drained = Some(token);
        self
    }

    pub(crate) fn fail_commits(&self, error: Error) {
        self.state.lock().failing_commit = Some(error);
    }

    /// Acts as if a rebalance moved the partition away, redeliveries are no longer possible.
    pub(crate) fn revoke(&self) {
        self.state.lock().revoked = true;
    }

    pub(crate) fn record(&self, offset: i64) -> SourceRecord {
        self.state.lock().records[offset as usize].clone()
    }

    pub(crate) fn committed(&self) -> Vec<i64> {
        self.state.lock().committed.clone()
    }

    pub(crate) fn redelivered(&self) -> Vec<i64> {
        self.state.lock().redelivered.clone()
    }
}

impl Source for MemorySource {
    async fn recv(&mut self) -> Result<Option<SourceRecord>> {
        let mut state = self.state.lock();
        let next = state.records.get(state.cursor).cloned();
        match next {
            Some(record) => {
                state.cursor += 1;
                Ok(Some(record))
            }
            None => {
                if let Some(token) = &self.drained {
                    token.cancel();
                }
                Ok(None)
            }
        }
    }

    async fn commit(&mut self, record: &SourceRecord) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(e) = &state.failing_commit {
            return Err(e.clone());
        }
        state.committed.push(record.offset);
        Ok(())
    }

    async fn redeliver(&mut self, record: &SourceRecord) -> Result<Redelivery> {
        let mut state = self.state.lock();
        if state.revoked {
            return Ok(Redelivery::Revoked);
        }
        state.cursor = record.offset as usize;
        state.redelivered.push(record.offset);
        Ok(Redelivery::Rewound)
    }
}

/// Summarizes as `summary of <title>` unless the item id was told to fail.
#[derive(Clone, Default)]
pub(crate) struct ScriptedEnricher {
    state: Arc<Mutex<EnricherState>>,
}

#[derive(Default)]
struct EnricherState {
    // id -> (remaining failures, None forever)
    failures: HashMap<i64, (Option<usize>, Error)>,
    calls: Vec<i64>,
}

impl ScriptedEnricher {
    pub(crate) fn fail(&self, id: i64, error: Error) {
        self.state.lock().failures.insert(id, (None, error));
    }

    pub(crate) fn fail_times(&self, id: i64, times: usize, error: Error) {
        self.state.lock().failures.insert(id, (Some(times), error));
    }

    pub(crate) fn calls(&self) -> Vec<i64> {
        self.state.lock().calls.clone()
    }
}

impl Enricher for ScriptedEnricher {
    async fn enrich(&self, item: &Item) -> Result<EnrichedItem> {
        let mut state = self.state.lock();
        state.calls.push(item.id);
        if let Some((remaining, error)) = state.failures.get_mut(&item.id) {
            match remaining {
                None => return Err(error.clone()),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(error.clone());
                }
            }
        }
        Ok(EnrichedItem::from_item(
            item,
            format!("summary of {}", item.title),
            fixed_time(),
        ))
    }
}

/// Replays canned fetch results and remembers the `since` of every call.
#[derive(Clone, Default)]
pub(crate) struct ScriptedFetcher {
    state: Arc<Mutex<FetcherState>>,
}

#[derive(Default)]
struct FetcherState {
    responses: VecDeque<Result<Fetched>>,
    calls: Vec<(DateTime<Utc>, tokio::time::Instant)>,
}

impl ScriptedFetcher {
    pub(crate) fn respond(&self, response: Result<Vec<Item>>) {
        self.state
            .lock()
            .responses
            .push_back(response.map(Fetched::from));
    }

    pub(crate) fn since_values(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().calls.iter().map(|(s, _)| *s).collect()
    }

    pub(crate) fn call_instants(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().calls.iter().map(|(_, at)| *at).collect()
    }
}

impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<Fetched> {
        let mut state = self.state.lock();
        state.calls.push((since, tokio::time::Instant::now()));
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Ok(Fetched::default()))
    }
}
