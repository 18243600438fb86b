use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::metrics::{relay_metrics, result_labels};
use crate::publisher::{Publisher, publish_items};
use crate::watermark::{Watermark, WatermarkStore};

/// What one fetch and publish cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    /// Items the source topic did not acknowledge, with the reason.
    pub failed: Vec<(i64, Error)>,
    /// Lower bound the fetch was issued with.
    pub since: DateTime<Utc>,
    /// The fetch stopped before the last page, the watermark only moved up to the last
    /// update it saw.
    pub truncated: bool,
    /// Watermark after the cycle.
    pub advanced_to: DateTime<Utc>,
}

/// Drives the tracker to source topic cycle and owns the watermark.
pub struct Scheduler<F, P, S> {
    fetcher: F,
    publisher: P,
    store: S,
    source_topic: String,
    config: SchedulerConfig,
    watermark: Watermark,
}

impl<F, P, S> Scheduler<F, P, S>
where
    F: Fetcher,
    P: Publisher + Sync,
    S: WatermarkStore,
{
    /// Resumes from the stored watermark, or starts `initial_lookback` in the past.
    pub async fn new(
        fetcher: F,
        publisher: P,
        store: S,
        source_topic: impl Into<String>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let watermark = match store.load().await? {
            Some(watermark) => {
                info!(since = %watermark.since, "Resuming from stored watermark");
                watermark
            }
            None => {
                let lookback = TimeDelta::from_std(config.initial_lookback)
                    .map_err(|e| Error::Config(format!("initial lookback out of range: {e}")))?;
                Watermark::new(Utc::now() - lookback)
            }
        };

        Ok(Scheduler {
            fetcher,
            publisher,
            store,
            source_topic: source_topic.into(),
            config,
            watermark,
        })
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Fetches everything updated since the watermark and publishes it to the source topic.
    /// A failed fetch leaves the watermark where it was, a truncated one moves it only as far
    /// as the fetched items reach. Items that fail to publish are reported but do not hold the
    /// watermark back.
    pub async fn cycle(&mut self) -> Result<CycleReport> {
        let since = self.watermark.since;
        // captured before the request so items updated while it is in flight are seen next time
        let started_at = Utc::now();

        let fetched = match self.fetcher.fetch(since).await {
            Ok(fetched) => fetched,
            Err(e) => {
                relay_metrics()
                    .poll_cycles
                    .get_or_create(&result_labels(false))
                    .inc();
                return Err(e);
            }
        };
        let items = fetched.items;
        relay_metrics().fetched_items.inc_by(items.len() as u64);

        let mut published = 0;
        let mut failed = Vec::new();
        for outcome in publish_items(&self.publisher, &self.source_topic, &items).await {
            relay_metrics()
                .source_published
                .get_or_create(&result_labels(outcome.result.is_ok()))
                .inc();
            match outcome.result {
                Ok(_) => published += 1,
                Err(e) => failed.push((outcome.id, e)),
            }
        }

        let advance_to = match fetched.truncated_at {
            Some(at) => {
                warn!(truncated_at = %at, "Fetch was cut short, the rest of the window is fetched next cycle");
                at.min(started_at)
            }
            None => started_at,
        };
        self.watermark = self.watermark.advance(advance_to);
        if let Err(e) = self.store.store(self.watermark).await {
            error!(?e, since = %self.watermark.since, "Failed to persist watermark, keeping it in memory");
        }
        relay_metrics()
            .poll_cycles
            .get_or_create(&result_labels(true))
            .inc();

        info!(
            fetched = items.len(),
            published,
            failed = failed.len(),
            since = %since,
            advanced_to = %self.watermark.since,
            "Poll cycle completed"
        );

        Ok(CycleReport {
            fetched: items.len(),
            published,
            failed,
            since,
            truncated: fetched.truncated_at.is_some(),
            advanced_to: self.watermark.since,
        })
    }

    /// Runs the first cycle immediately, then one every poll period until cancelled. A failed
    /// cycle is not retried early, the next one picks up the same window. After a rate limit
    /// the wait is stretched to whatever the tracker asked for.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            period = ?self.config.poll_period,
            topic = %self.source_topic,
            "Starting poll schedule"
        );
        loop {
            let delay = match self.cycle().await {
                Ok(_) => self.config.poll_period,
                Err(e) => self.delay_after(&e),
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation token received, stopping the poll schedule");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn delay_after(&self, e: &Error) -> Duration {
        match e {
            Error::RateLimit { retry_after } => {
                let delay = retry_after
                    .unwrap_or_default()
                    .max(self.config.rate_limit_backoff);
                warn!(?retry_after, ?delay, "Tracker rate limited the fetch, backing off");
                delay
            }
            e => {
                error!(?e, kind = e.kind(), "Poll cycle failed, the next cycle retries the same window");
                self.config.poll_period
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::TrackerConfig;
    use crate::fetcher::github::GitHubFetcher;
    use crate::message::Item;
    use crate::test_utils::{MemoryPublisher, ScriptedFetcher, fixed_time, item};
    use crate::watermark::InMemoryWatermarkStore;

    const TOPIC: &str = "github-issues";

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_period: Duration::from_secs(3600),
            initial_lookback: Duration::from_secs(86400),
            rate_limit_backoff: Duration::from_secs(10),
            watermark_path: None,
        }
    }

    async fn scheduler(
        fetcher: &ScriptedFetcher,
        publisher: &MemoryPublisher,
        store: &InMemoryWatermarkStore,
    ) -> Scheduler<ScriptedFetcher, MemoryPublisher, InMemoryWatermarkStore> {
        Scheduler::new(
            fetcher.clone(),
            publisher.clone(),
            store.clone(),
            TOPIC,
            config(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_watermark_uses_lookback() {
        let before = Utc::now();
        let s = scheduler(
            &ScriptedFetcher::default(),
            &MemoryPublisher::default(),
            &InMemoryWatermarkStore::default(),
        )
        .await;
        let lookback = TimeDelta::seconds(86400);
        assert!(s.watermark().since >= before - lookback);
        assert!(s.watermark().since <= Utc::now() - lookback);
    }

    #[tokio::test]
    async fn test_cycle_publishes_keyed_items_and_advances() {
        let fetcher = ScriptedFetcher::default();
        let publisher = MemoryPublisher::default();
        let store = InMemoryWatermarkStore::default();
        fetcher.respond(Ok(vec![item(1, "a", ""), item(2, "b", "x")]));

        let mut s = scheduler(&fetcher, &publisher, &store).await;
        let start = s.watermark().since;
        let report = s.cycle().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.published, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.since, start);
        assert!(report.advanced_to > start);

        let written = publisher.records(TOPIC);
        assert_eq!(written[0].0, "1");
        assert_eq!(Item::decode(&written[1].1).unwrap(), item(2, "b", "x"));
        assert_eq!(
            store.load().await.unwrap(),
            Some(Watermark::new(report.advanced_to))
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_watermark() {
        let fetcher = ScriptedFetcher::default();
        let store = InMemoryWatermarkStore::default();
        fetcher.respond(Err(Error::Transport("connection reset".into())));

        let mut s = scheduler(&fetcher, &MemoryPublisher::default(), &store).await;
        let start = s.watermark();
        assert!(s.cycle().await.is_err());
        assert_eq!(s.watermark(), start);
        assert_eq!(store.load().await.unwrap(), None);

        s.cycle().await.unwrap();
        assert_eq!(fetcher.since_values(), vec![start.since, start.since]);
    }

    #[tokio::test]
    async fn test_publish_failures_are_reported_not_fatal() {
        let fetcher = ScriptedFetcher::default();
        let publisher = MemoryPublisher::default();
        fetcher.respond(Ok(vec![item(1, "a", ""), item(2, "b", ""), item(3, "c", "")]));
        publisher.fail_key("2", Error::Transport("timed out".into()));

        let mut s = scheduler(&fetcher, &publisher, &InMemoryWatermarkStore::default()).await;
        let start = s.watermark().since;
        let report = s.cycle().await.unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(report.failed, vec![(2, Error::Transport("timed out".into()))]);
        assert!(report.advanced_to > start);
    }

    #[tokio::test]
    async fn test_resumes_from_stored_watermark() {
        let stored = Watermark::new(Utc::now() - TimeDelta::minutes(5));
        let fetcher = ScriptedFetcher::default();
        let s = scheduler(
            &fetcher,
            &MemoryPublisher::default(),
            &InMemoryWatermarkStore::new(Some(stored)),
        )
        .await;
        assert_eq!(s.watermark(), stored);
    }

    #[tokio::test]
    async fn test_truncated_fetch_resumes_from_last_update() {
        let server = MockServer::start().await;
        let next = format!(
            "<{}/repos/bootc-dev/bootc/issues?page=2>; rel=\"next\"",
            server.uri()
        );
        let issue = |id: i64, updated_at: &str| {
            serde_json::json!({
                "id": id,
                "number": id,
                "title": format!("issue {id}"),
                "body": null,
                "html_url": format!("https://github.com/bootc-dev/bootc/issues/{id}"),
                "updated_at": updated_at
            })
        };
        // the listing never ends within one page
        Mock::given(method("GET"))
            .and(query_param("since", "2024-01-01T00:00:00Z"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(vec![
                        issue(1, "2024-01-01T03:00:00Z"),
                        issue(2, "2024-01-01T05:00:00Z"),
                    ]),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("since", "2024-01-01T05:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![issue(3, "2024-01-01T06:00:00Z")]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = GitHubFetcher::new(&TrackerConfig {
            api_url: server.uri(),
            owner: "bootc-dev".into(),
            repo: "bootc".into(),
            token: None,
            max_pages: 1,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let start = Watermark::new(fixed_time());
        let store = InMemoryWatermarkStore::new(Some(start));
        let publisher = MemoryPublisher::default();
        let mut s = Scheduler::new(fetcher, publisher.clone(), store.clone(), TOPIC, config())
            .await
            .unwrap();

        let report = s.cycle().await.unwrap();
        assert!(report.truncated);
        assert_eq!(report.published, 2);
        let last_seen = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();
        assert_eq!(report.advanced_to, last_seen);
        assert_eq!(store.load().await.unwrap(), Some(Watermark::new(last_seen)));

        let report = s.cycle().await.unwrap();
        assert!(!report.truncated);
        assert_eq!(report.since, last_seen);
        assert!(report.advanced_to > last_seen);
        assert_eq!(publisher.records(TOPIC).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_starts_immediately_and_backs_off_on_rate_limit() {
        let fetcher = ScriptedFetcher::default();
        fetcher.respond(Err(Error::RateLimit {
            retry_after: Some(Duration::from_secs(30)),
        }));
        fetcher.respond(Err(Error::RateLimit { retry_after: None }));
        fetcher.respond(Ok(vec![]));

        let s = scheduler(
            &fetcher,
            &MemoryPublisher::default(),
            &InMemoryWatermarkStore::default(),
        )
        .await;
        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.run(cancel.clone()));

        while fetcher.call_instants().len() < 4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let offsets: Vec<u64> = fetcher
            .call_instants()
            .iter()
            .map(|at| at.duration_since(started).as_secs())
            .collect();
        // immediate, retry-after wins over the floor, the floor applies without a hint,
        // then the regular period
        assert_eq!(offsets, vec![0, 30, 40, 3640]);
    }
}
