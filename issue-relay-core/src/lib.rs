//! Polls an issue tracker into a source topic and summarizes every record of that topic into a
//! derived topic, committing a source record only after its derived record is acknowledged.
//!
//! Two loops, either of which may run alone:
//! - [scheduler]: tracker -> source topic, driven by a watermark.
//! - [pipeline]: source topic -> summarizer -> derived topic.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use issue_relay_kafka::{KafkaConsumer, KafkaConsumerConfig, KafkaProducer, KafkaProducerConfig};

pub use crate::error::{Error, Result};

use crate::config::Settings;
use crate::enricher::openai::OpenAiSummarizer;
use crate::fetcher::github::GitHubFetcher;
use crate::pipeline::{PipelineTopics, TransformPipeline};
use crate::publisher::kafka::KafkaPublisher;
use crate::scheduler::Scheduler;
use crate::watermark::InMemoryWatermarkStore;
use crate::watermark::file::FileWatermarkStore;

/// Environment and command line configuration.
pub mod config;

/// Summarization of a single item.
pub mod enricher;

pub mod error;

/// Tracker access.
pub mod fetcher;

/// Record formats of the source and derived topics.
pub mod message;

/// Prometheus metrics and the server exposing them.
pub mod metrics;

/// Source topic to derived topic.
pub mod pipeline;

/// Writing records to a topic.
pub mod publisher;

/// Tracker to source topic on a fixed period.
pub mod scheduler;

/// Reading the source topic.
pub mod source;

/// Where the next fetch starts.
pub mod watermark;

#[cfg(test)]
mod test_utils;

/// Which of the loops to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Poll,
    Transform,
    Both,
}

/// Starts the metrics server and the loops selected by `mode`, and returns once they stopped.
/// Startup problems (bad credentials, unreachable broker) are returned before any work is done.
pub async fn run(settings: Settings, mode: Mode, cancel: CancellationToken) -> Result<()> {
    if matches!(mode, Mode::Transform | Mode::Both) {
        settings.require_summarizer_key()?;
    }

    if settings.metrics_port != 0 {
        let metrics_cancel = cancel.clone();
        let port = settings.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(port, metrics_cancel).await {
                error!(?e, "Metrics server stopped");
            }
        });
    }

    let result = match mode {
        Mode::Poll => run_poller(&settings, cancel.clone()).await,
        Mode::Transform => run_transformer(&settings, cancel.clone()).await,
        Mode::Both => tokio::try_join!(
            run_poller(&settings, cancel.clone()),
            run_transformer(&settings, cancel.clone())
        )
        .map(|_| ()),
    };

    // whatever stopped first takes the metrics server down with it
    cancel.cancel();
    result
}

/// Runs the scheduler until `cancel` fires.
pub async fn run_poller(settings: &Settings, cancel: CancellationToken) -> Result<()> {
    let producer = connect_producer(settings).await?;
    let fetcher = GitHubFetcher::new(&settings.tracker)?;
    let publisher = KafkaPublisher::new(producer);
    let topic = settings.broker.source_topic.clone();
    let config = settings.scheduler.clone();

    info!(
        owner = %settings.tracker.owner,
        repo = %settings.tracker.repo,
        topic = %topic,
        "Starting poller"
    );
    match &settings.scheduler.watermark_path {
        Some(path) => {
            let store = FileWatermarkStore::new(path);
            Scheduler::new(fetcher, publisher, store, topic, config)
                .await?
                .run(cancel)
                .await
        }
        None => {
            let store = InMemoryWatermarkStore::default();
            Scheduler::new(fetcher, publisher, store, topic, config)
                .await?
                .run(cancel)
                .await
        }
    }
    Ok(())
}

/// Runs the transform pipeline until `cancel` fires.
pub async fn run_transformer(settings: &Settings, cancel: CancellationToken) -> Result<()> {
    settings.require_summarizer_key()?;
    let enricher = OpenAiSummarizer::new(&settings.summarizer)?;
    let producer = connect_producer(settings).await?;
    let consumer = KafkaConsumer::connect(
        KafkaConsumerConfig {
            brokers: settings.broker.brokers.clone(),
            topic: settings.broker.source_topic.clone(),
            consumer_group: settings.broker.group_id.clone(),
            read_timeout: settings.broker.read_timeout,
            raw_config: settings.broker.raw_config.clone(),
        },
        cancel.clone(),
    )
    .await?;

    info!(
        source = %settings.broker.source_topic,
        group = %settings.broker.group_id,
        "Starting transformer"
    );
    TransformPipeline::new(
        consumer,
        enricher,
        KafkaPublisher::new(producer),
        PipelineTopics {
            derived: settings.broker.derived_topic.clone(),
            dead_letter: settings.broker.dead_letter_topic.clone(),
        },
        settings.pipeline.clone(),
    )
    .run(cancel)
    .await
}

async fn connect_producer(settings: &Settings) -> Result<KafkaProducer> {
    let producer = KafkaProducer::new(KafkaProducerConfig {
        brokers: settings.broker.brokers.clone(),
        delivery_timeout: settings.broker.publish_timeout,
        raw_config: settings.broker.raw_config.clone(),
    })?;
    producer.check_connection().await?;
    Ok(producer)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Installing Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Installing SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
