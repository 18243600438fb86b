use chrono::{DateTime, Utc};

use crate::message::Item;

/// [GitHub] issues listing.
///
/// [GitHub]: https://docs.github.com/en/rest/issues/issues#list-repository-issues
pub mod github;

/// Items returned by one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fetched {
    pub items: Vec<Item>,
    /// Set when the fetch stopped before the last page. Everything updated before this instant
    /// was returned, the next fetch has to start here instead of at the fetch time.
    pub truncated_at: Option<DateTime<Utc>>,
}

impl From<Vec<Item>> for Fetched {
    fn from(items: Vec<Item>) -> Self {
        Fetched {
            items,
            truncated_at: None,
        }
    }
}

/// Pulls the tracker items updated since a point in time.
#[trait_variant::make(Fetcher: Send)]
pub trait LocalFetcher {
    /// Open items the tracker reports as updated at or after `since`, oldest update first.
    /// The result is not filtered again on our side.
    async fn fetch(&self, since: DateTime<Utc>) -> crate::Result<Fetched>;
}
