//! Records that travel on the two topics. Field names on the wire follow the tracker's JSON
//! (`number`, `html_url`), so the same [Item] decodes a tracker response and a source record.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// One tracker item as fetched and as published on the source topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    #[serde(rename = "number")]
    pub sequence_number: i64,
    pub title: String,
    /// The tracker sends `null` for an issue without description.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
    #[serde(rename = "html_url")]
    pub url: String,
}

impl Item {
    /// Partitioning key, the decimal id.
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// The summarized form of an [Item], published on the derived topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedItem {
    pub id: i64,
    #[serde(rename = "number")]
    pub sequence_number: i64,
    pub title: String,
    pub summary: String,
    #[serde(rename = "html_url")]
    pub url: String,
    pub original_body: String,
    #[serde(with = "rfc3339_seconds")]
    pub processed_at: DateTime<Utc>,
}

impl EnrichedItem {
    /// Carries the identity fields of `item` forward.
    pub fn from_item(item: &Item, summary: String, processed_at: DateTime<Utc>) -> Self {
        EnrichedItem {
            id: item.id,
            sequence_number: item.sequence_number,
            title: item.title.clone(),
            summary,
            url: item.url.clone(),
            original_body: item.body.clone(),
            processed_at,
        }
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// RFC3339 with second precision and a `Z` suffix, the format the tracker accepts for `since`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
