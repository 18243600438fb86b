use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{Credential, SummarizerConfig};
use crate::enricher::Enricher;
use crate::error::{Error, Malformed, Result};
use crate::message::{EnrichedItem, Item};

/// Source of `processed_at`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

// Every level is optional so each missing piece gets its own error instead of one serde message.
#[derive(Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<Value>,
}

fn prompt(item: &Item) -> String {
    format!(
        "Summarize this GitHub issue in 2-3 sentences:\n\nTitle: {}\nBody: {}\n\nSummary:",
        item.title, item.body
    )
}

/// Pulls the summary out of a successful response body.
fn parse_summary(body: &[u8]) -> std::result::Result<String, Malformed> {
    let response: ChatResponse =
        serde_json::from_slice(body).map_err(|e| Malformed::Invalid(e.to_string()))?;
    let choice = response
        .choices
        .ok_or(Malformed::MissingChoices)?
        .into_iter()
        .next()
        .ok_or(Malformed::EmptyChoices)?;
    let content = choice
        .message
        .ok_or(Malformed::MissingMessage)?
        .content
        .ok_or(Malformed::MissingContent)?;
    let Value::String(content) = content else {
        return Err(Malformed::ContentNotString);
    };
    let summary = content.trim();
    if summary.is_empty() {
        return Err(Malformed::EmptyContent);
    }
    Ok(summary.to_string())
}

/// Summarizes issues through a chat-completions call.
#[derive(Clone)]
pub struct OpenAiSummarizer {
    client: Client,
    url: String,
    model: String,
    api_key: Option<Credential>,
    max_tokens: u32,
    temperature: f32,
    clock: Clock,
}

impl OpenAiSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Building summarizer HTTP client: {e}")))?;
        Ok(OpenAiSummarizer {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replaces the wall clock used for `processed_at`.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl Enricher for OpenAiSummarizer {
    async fn enrich(&self, item: &Item) -> Result<EnrichedItem> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(Error::MissingCredential(crate::config::ENV_OPENAI_API_KEY))?;

        let prompt = prompt(item);
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key.expose())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let summary = parse_summary(&body).map_err(Error::MalformedResponse)?;
        debug!(id = item.id, "Summarized item");
        Ok(EnrichedItem::from_item(item, summary, (self.clock)()))
    }
}
