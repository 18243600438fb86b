use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, LINK, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{Credential, TrackerConfig};
use crate::error::{Error, Result};
use crate::fetcher::{Fetched, Fetcher};
use crate::message::{Item, format_timestamp};

const PER_PAGE: &str = "100";
const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("issue-relay/", env!("CARGO_PKG_VERSION"));
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// An issue as listed by the tracker. Only `updated_at` is read besides the [Item] fields.
#[derive(Debug, Deserialize)]
struct TrackerIssue {
    #[serde(flatten)]
    item: Item,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Lists the open issues of one repository, least recently updated first, so a listing cut
/// short at `max_pages` still covers a contiguous range of update times.
#[derive(Debug, Clone)]
pub struct GitHubFetcher {
    client: Client,
    issues_url: String,
    token: Option<Credential>,
    max_pages: usize,
}

impl GitHubFetcher {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("Building tracker HTTP client: {e}")))?;

        Ok(GitHubFetcher {
            client,
            issues_url: format!(
                "{}/repos/{}/{}/issues",
                config.api_url.trim_end_matches('/'),
                config.owner,
                config.repo
            ),
            token: config.token.clone(),
            max_pages: config.max_pages,
        })
    }

    /// Fetches with an explicit credential instead of the configured one.
    pub async fn fetch_with(
        &self,
        since: DateTime<Utc>,
        credential: Option<&Credential>,
    ) -> Result<Fetched> {
        let since_param = format_timestamp(since);
        let mut items = Vec::new();
        let mut last_updated: Option<DateTime<Utc>> = None;
        let mut next_page: Option<String> = None;

        for page in 1..=self.max_pages {
            let request = match next_page.take() {
                // the next link already carries the query
                Some(url) => self.client.get(url),
                None => self.client.get(&self.issues_url).query(&[
                    ("since", since_param.as_str()),
                    ("state", "open"),
                    ("sort", "updated"),
                    ("direction", "asc"),
                    ("per_page", PER_PAGE),
                ]),
            };

            let response = authorize(request, credential)
                .header(ACCEPT, ACCEPT_GITHUB_JSON)
                .send()
                .await?;
            let response = check_status(response).await?;
            next_page = next_link(response.headers());

            let body = response.bytes().await?;
            let page_issues: Vec<TrackerIssue> = serde_json::from_slice(&body)
                .map_err(|e| Error::Decode(format!("Tracker page {page}: {e}")))?;
            debug!(page, count = page_issues.len(), "Fetched tracker page");
            for issue in page_issues {
                last_updated = issue.updated_at.or(last_updated);
                items.push(issue.item);
            }

            if next_page.is_none() {
                return Ok(Fetched::from(items));
            }
        }

        // without an update time on the last item, the window cannot be split safely
        let truncated_at = last_updated.unwrap_or(since).max(since);
        warn!(
            max_pages = self.max_pages,
            fetched = items.len(),
            truncated_at = %truncated_at,
            "Stopped following tracker pagination, the next fetch resumes from the last update seen"
        );
        Ok(Fetched {
            items,
            truncated_at: Some(truncated_at),
        })
    }
}

impl Fetcher for GitHubFetcher {
    async fn fetch(&self, since: DateTime<Utc>) -> Result<Fetched> {
        self.fetch_with(since, self.token.as_ref()).await
    }
}

fn authorize(request: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
    match credential {
        Some(token) => request.header(AUTHORIZATION, format!("token {}", token.expose())),
        None => request,
    }
}

/// Maps a non-success response to the matching error. 429 is always a rate limit, 403 only
/// when the quota header says so; anything else keeps its status and body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let headers = response.headers();
    let quota_exhausted = headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        return Err(Error::RateLimit {
            retry_after: retry_after(headers),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Transport(format!(
        "tracker responded with {status}: {body}"
    )))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Extracts the `rel="next"` target from a `Link` header such as
/// `<https://api.github.com/...&page=2>; rel="next", <...&page=5>; rel="last"`.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == r#"rel="next""#);
        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}
