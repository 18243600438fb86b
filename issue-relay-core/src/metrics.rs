use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;

// Every metric is registered under this prefix.
const REGISTRY_PREFIX: &str = "relay";

// Names carry no suffix, prometheus-client appends `_total` to counters.
const POLL_CYCLES: &str = "poll_cycles";
const FETCHED_ITEMS: &str = "fetched_items";
const SOURCE_PUBLISHED: &str = "source_published";
const RECORDS_READ: &str = "records_read";
const RECORDS_COMMITTED: &str = "records_committed";
const POISON_MESSAGES: &str = "poison_messages";
const ENRICH_FAILURES: &str = "enrich_failures";
const PUBLISH_FAILURES: &str = "publish_failures";
const DEAD_LETTERED: &str = "dead_lettered";
const ENRICH_TIME: &str = "enrich_time";

const RESULT_LABEL: &str = "result";
const KIND_LABEL: &str = "kind";

pub(crate) type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    // a plain mutex is fine, metrics are registered once and the lock is held only to encode
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

/// Counters and timers of both loops.
pub struct RelayMetrics {
    pub poll_cycles: Family<Labels, Counter>,
    pub fetched_items: Counter,
    pub source_published: Family<Labels, Counter>,
    pub records_read: Counter,
    pub records_committed: Counter,
    pub poison_messages: Counter,
    pub enrich_failures: Family<Labels, Counter>,
    pub publish_failures: Counter,
    pub dead_lettered: Counter,
    /// Microseconds spent per enrichment call, retries included.
    pub enrich_time: Histogram,
}

/// Exponential bucket distribution, `length` buckets from `min` to `max`. The +Inf bucket is
/// implied.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length.max(2)) - 1.0));
    iter::successors(Some(min), move |b| Some(b * growth_factor)).take(length.into())
}

impl RelayMetrics {
    fn new() -> Self {
        let metrics = Self {
            poll_cycles: Family::default(),
            fetched_items: Counter::default(),
            source_published: Family::default(),
            records_read: Counter::default(),
            records_committed: Counter::default(),
            poison_messages: Counter::default(),
            enrich_failures: Family::default(),
            publish_failures: Counter::default(),
            dead_lettered: Counter::default(),
            // 1ms to 5 minutes
            enrich_time: Histogram::new(exponential_buckets_range(1_000.0, 300_000_000.0, 10)),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            POLL_CYCLES,
            "Scheduler cycles by result",
            metrics.poll_cycles.clone(),
        );
        registry.register(
            FETCHED_ITEMS,
            "Items returned by the tracker",
            metrics.fetched_items.clone(),
        );
        registry.register(
            SOURCE_PUBLISHED,
            "Items written to the source topic by result",
            metrics.source_published.clone(),
        );
        registry.register(
            RECORDS_READ,
            "Records read from the source topic",
            metrics.records_read.clone(),
        );
        registry.register(
            RECORDS_COMMITTED,
            "Source records committed after their derived record was acknowledged",
            metrics.records_committed.clone(),
        );
        registry.register(
            POISON_MESSAGES,
            "Undecodable source records committed and skipped",
            metrics.poison_messages.clone(),
        );
        registry.register(
            ENRICH_FAILURES,
            "Failed enrichments by error kind",
            metrics.enrich_failures.clone(),
        );
        registry.register(
            PUBLISH_FAILURES,
            "Derived records the broker did not acknowledge",
            metrics.publish_failures.clone(),
        );
        registry.register(
            DEAD_LETTERED,
            "Source records moved to the dead-letter topic",
            metrics.dead_lettered.clone(),
        );
        registry.register(
            ENRICH_TIME,
            "Time spent enriching one record in microseconds",
            metrics.enrich_time.clone(),
        );

        metrics
    }
}

static RELAY_METRICS: OnceLock<RelayMetrics> = OnceLock::new();

/// The process wide metrics, registered on first use.
pub fn relay_metrics() -> &'static RelayMetrics {
    RELAY_METRICS.get_or_init(RelayMetrics::new)
}

pub(crate) fn result_labels(ok: bool) -> Labels {
    vec![(
        RESULT_LABEL.to_string(),
        if ok { "success" } else { "failure" }.to_string(),
    )]
}

pub(crate) fn kind_labels(kind: &str) -> Labels {
    vec![(KIND_LABEL.to_string(), kind.to_string())]
}

/// Snapshot of the registry in the OpenMetrics text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &global_registry().registry.lock()) {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!(bytes = buffer.len(), "Exposing metrics");
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        Body::from(buffer),
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub(crate) fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves `/metrics` and `/livez` on all interfaces until `cancel` fires.
pub async fn start_metrics_server(port: u16, cancel: CancellationToken) -> crate::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Metrics server listening");
    serve(listener, cancel).await
}

async fn serve(listener: TcpListener, cancel: CancellationToken) -> crate::Result<()> {
    // register before the first scrape so every series shows up
    relay_metrics();
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Serving metrics: {e}")))
}
