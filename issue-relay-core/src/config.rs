use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_BROKER_ADDRESS: &str = "RELAY_BROKER_ADDRESS";
const ENV_SOURCE_TOPIC: &str = "RELAY_SOURCE_TOPIC";
const ENV_DERIVED_TOPIC: &str = "RELAY_DERIVED_TOPIC";
const ENV_DEAD_LETTER_TOPIC: &str = "RELAY_DEAD_LETTER_TOPIC";
const ENV_GROUP_ID: &str = "RELAY_GROUP_ID";
const ENV_KAFKA_CONFIG: &str = "RELAY_KAFKA_CONFIG";
const ENV_TRACKER_OWNER: &str = "RELAY_TRACKER_OWNER";
const ENV_TRACKER_REPO: &str = "RELAY_TRACKER_REPO";
const ENV_TRACKER_API_URL: &str = "RELAY_TRACKER_API_URL";
const ENV_TRACKER_MAX_PAGES: &str = "RELAY_TRACKER_MAX_PAGES";
const ENV_POLL_PERIOD_SECS: &str = "RELAY_POLL_PERIOD_SECS";
const ENV_INITIAL_LOOKBACK_SECS: &str = "RELAY_INITIAL_LOOKBACK_SECS";
const ENV_RATE_LIMIT_BACKOFF_SECS: &str = "RELAY_RATE_LIMIT_BACKOFF_SECS";
const ENV_WATERMARK_PATH: &str = "RELAY_WATERMARK_PATH";
const ENV_SUMMARIZER_URL: &str = "RELAY_SUMMARIZER_URL";
const ENV_SUMMARIZER_MODEL: &str = "RELAY_SUMMARIZER_MODEL";
const ENV_SUMMARIZER_MAX_TOKENS: &str = "RELAY_SUMMARIZER_MAX_TOKENS";
const ENV_SUMMARIZER_TEMPERATURE: &str = "RELAY_SUMMARIZER_TEMPERATURE";
const ENV_HTTP_TIMEOUT_SECS: &str = "RELAY_HTTP_TIMEOUT_SECS";
const ENV_PUBLISH_TIMEOUT_MS: &str = "RELAY_PUBLISH_TIMEOUT_MS";
const ENV_MAX_ATTEMPTS: &str = "RELAY_MAX_ATTEMPTS";
const ENV_ENRICH_RETRIES: &str = "RELAY_ENRICH_RETRIES";
const ENV_METRICS_PORT: &str = "RELAY_METRICS_PORT";
pub(crate) const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub(crate) const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

const DEFAULT_BROKER_ADDRESS: &str = "localhost:9092";
const DEFAULT_SOURCE_TOPIC: &str = "github-issues";
const DEFAULT_DERIVED_TOPIC: &str = "github-issues-summarized";
const DEFAULT_GROUP_ID: &str = "github-issues-summarizer";
const DEFAULT_TRACKER_OWNER: &str = "bootc-dev";
const DEFAULT_TRACKER_REPO: &str = "bootc";
const DEFAULT_TRACKER_API_URL: &str = "https://api.github.com";
const DEFAULT_TRACKER_MAX_PAGES: usize = 10;
const DEFAULT_POLL_PERIOD_SECS: u64 = 24 * 60 * 60;
const DEFAULT_INITIAL_LOOKBACK_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 15 * 60;
const DEFAULT_SUMMARIZER_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_SUMMARIZER_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_SUMMARIZER_MAX_TOKENS: u32 = 150;
const DEFAULT_SUMMARIZER_TEMPERATURE: f32 = 0.3;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_ENRICH_RETRIES: usize = 3;
const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_REDELIVERY_DELAY_MS: u64 = 1000;

/// A secret passed through to an upstream. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub brokers: Vec<String>,
    pub source_topic: String,
    pub derived_topic: String,
    pub dead_letter_topic: Option<String>,
    pub group_id: String,
    pub publish_timeout: Duration,
    /// How long a single consumer poll waits before checking for shutdown.
    pub read_timeout: Duration,
    /// librdkafka options from `RELAY_KAFKA_CONFIG`, as `key=value` pairs separated by commas.
    pub raw_config: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: Option<Credential>,
    pub max_pages: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizerConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<Credential>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_period: Duration,
    pub initial_lookback: Duration,
    pub rate_limit_backoff: Duration,
    pub watermark_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Failed attempts before a record goes to the dead-letter topic, `0` never gives up.
    pub max_attempts: u32,
    /// In-process retries of a transient enrichment failure.
    pub enrich_retries: usize,
    /// Pause before a failed record is read again.
    pub redelivery_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub tracker: TrackerConfig,
    pub summarizer: SummarizerConfig,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    /// `0` disables the metrics server.
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            broker: BrokerConfig {
                brokers: vec![DEFAULT_BROKER_ADDRESS.to_string()],
                source_topic: DEFAULT_SOURCE_TOPIC.to_string(),
                derived_topic: DEFAULT_DERIVED_TOPIC.to_string(),
                dead_letter_topic: None,
                group_id: DEFAULT_GROUP_ID.to_string(),
                publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
                read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
                raw_config: HashMap::new(),
            },
            tracker: TrackerConfig {
                api_url: DEFAULT_TRACKER_API_URL.to_string(),
                owner: DEFAULT_TRACKER_OWNER.to_string(),
                repo: DEFAULT_TRACKER_REPO.to_string(),
                token: None,
                max_pages: DEFAULT_TRACKER_MAX_PAGES,
                timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            },
            summarizer: SummarizerConfig {
                url: DEFAULT_SUMMARIZER_URL.to_string(),
                model: DEFAULT_SUMMARIZER_MODEL.to_string(),
                api_key: None,
                max_tokens: DEFAULT_SUMMARIZER_MAX_TOKENS,
                temperature: DEFAULT_SUMMARIZER_TEMPERATURE,
                timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            },
            scheduler: SchedulerConfig {
                poll_period: Duration::from_secs(DEFAULT_POLL_PERIOD_SECS),
                initial_lookback: Duration::from_secs(DEFAULT_INITIAL_LOOKBACK_SECS),
                rate_limit_backoff: Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
                watermark_path: None,
            },
            pipeline: PipelineConfig {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                enrich_retries: DEFAULT_ENRICH_RETRIES,
                redelivery_delay: Duration::from_millis(DEFAULT_REDELIVERY_DELAY_MS),
            },
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl Settings {
    /// Builds the settings from environment variables, falling back to defaults for anything
    /// unset. Values that are set but cannot be parsed are an error.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _)| key.starts_with("RELAY_") || is_credential(key))
            .collect();

        let get = |var: &str| -> Option<String> {
            env_vars
                .get(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Settings::default();

        if let Some(address) = get(ENV_BROKER_ADDRESS) {
            settings.broker.brokers = parse_brokers(&address)?;
        }
        if let Some(topic) = get(ENV_SOURCE_TOPIC) {
            settings.broker.source_topic = topic;
        }
        if let Some(topic) = get(ENV_DERIVED_TOPIC) {
            settings.broker.derived_topic = topic;
        }
        settings.broker.dead_letter_topic = get(ENV_DEAD_LETTER_TOPIC);
        if let Some(group) = get(ENV_GROUP_ID) {
            settings.broker.group_id = group;
        }
        if let Some(raw) = get(ENV_KAFKA_CONFIG) {
            settings.broker.raw_config = parse_raw_config(&raw)?;
        }
        if let Some(ms) = parse_var::<u64>(&get, ENV_PUBLISH_TIMEOUT_MS)? {
            settings.broker.publish_timeout = Duration::from_millis(ms);
        }

        if let Some(owner) = get(ENV_TRACKER_OWNER) {
            settings.tracker.owner = owner;
        }
        if let Some(repo) = get(ENV_TRACKER_REPO) {
            settings.tracker.repo = repo;
        }
        if let Some(url) = get(ENV_TRACKER_API_URL) {
            settings.tracker.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(pages) = parse_var::<usize>(&get, ENV_TRACKER_MAX_PAGES)? {
            settings.tracker.max_pages = pages;
        }
        settings.tracker.token = get(ENV_GITHUB_TOKEN).map(Credential::new);

        if let Some(url) = get(ENV_SUMMARIZER_URL) {
            settings.summarizer.url = url;
        }
        if let Some(model) = get(ENV_SUMMARIZER_MODEL) {
            settings.summarizer.model = model;
        }
        if let Some(tokens) = parse_var::<u32>(&get, ENV_SUMMARIZER_MAX_TOKENS)? {
            settings.summarizer.max_tokens = tokens;
        }
        if let Some(temperature) = parse_var::<f32>(&get, ENV_SUMMARIZER_TEMPERATURE)? {
            settings.summarizer.temperature = temperature;
        }
        settings.summarizer.api_key = get(ENV_OPENAI_API_KEY).map(Credential::new);

        if let Some(secs) = parse_var::<u64>(&get, ENV_HTTP_TIMEOUT_SECS)? {
            settings.tracker.timeout = Duration::from_secs(secs);
            settings.summarizer.timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>(&get, ENV_POLL_PERIOD_SECS)? {
            settings.scheduler.poll_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&get, ENV_INITIAL_LOOKBACK_SECS)? {
            settings.scheduler.initial_lookback = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&get, ENV_RATE_LIMIT_BACKOFF_SECS)? {
            settings.scheduler.rate_limit_backoff = Duration::from_secs(secs);
        }
        settings.scheduler.watermark_path = get(ENV_WATERMARK_PATH).map(PathBuf::from);

        if let Some(attempts) = parse_var::<u32>(&get, ENV_MAX_ATTEMPTS)? {
            settings.pipeline.max_attempts = attempts;
        }
        if let Some(retries) = parse_var::<usize>(&get, ENV_ENRICH_RETRIES)? {
            settings.pipeline.enrich_retries = retries;
        }

        if let Some(port) = parse_var::<u16>(&get, ENV_METRICS_PORT)? {
            settings.metrics_port = port;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks invariants that hold regardless of which loop runs. Call again after applying
    /// command line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.broker.brokers.is_empty() {
            return Err(Error::Config("at least one broker address is required".into()));
        }
        if self.broker.source_topic == self.broker.derived_topic {
            return Err(Error::Config(format!(
                "source and derived topic must differ, both are {}",
                self.broker.source_topic
            )));
        }
        if let Some(dlq) = &self.broker.dead_letter_topic
            && (dlq == &self.broker.source_topic || dlq == &self.broker.derived_topic)
        {
            return Err(Error::Config(format!(
                "dead-letter topic {dlq} must differ from the source and derived topics"
            )));
        }
        if self.scheduler.poll_period.is_zero() {
            return Err(Error::Config(format!("{ENV_POLL_PERIOD_SECS} must be positive")));
        }
        if self.tracker.max_pages == 0 {
            return Err(Error::Config(format!("{ENV_TRACKER_MAX_PAGES} must be positive")));
        }
        if !(0.0..=2.0).contains(&self.summarizer.temperature) {
            return Err(Error::Config(format!(
                "{ENV_SUMMARIZER_TEMPERATURE} must be within 0.0 and 2.0, got {}",
                self.summarizer.temperature
            )));
        }
        if self.broker.publish_timeout.is_zero() || self.tracker.timeout.is_zero() {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// The transform loop cannot do anything useful without a summarizer key.
    pub fn require_summarizer_key(&self) -> Result<&Credential> {
        self.summarizer
            .api_key
            .as_ref()
            .ok_or(Error::MissingCredential(ENV_OPENAI_API_KEY))
    }
}

fn is_credential(key: &str) -> bool {
    key == ENV_GITHUB_TOKEN || key == ENV_OPENAI_API_KEY
}

fn parse_var<T>(get: impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("Parsing {var}={raw}: {e}")))
        })
        .transpose()
}

/// Parses a comma separated broker list.
pub fn parse_brokers(raw: &str) -> Result<Vec<String>> {
    let brokers: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect();
    if brokers.is_empty() {
        return Err(Error::Config(format!("No broker address in {raw:?}")));
    }
    Ok(brokers)
}

fn parse_raw_config(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::Config(format!("{ENV_KAFKA_CONFIG}: expected key=value, got {pair}")))
        })
        .collect()
}
