use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::source::SourceRecord;

/// Envelope written to the dead-letter topic for a record that kept failing. The original
/// payload is kept verbatim (base64) so the record can be replayed onto the source topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub original_payload: String,
    pub error: String,
    pub error_kind: String,
    pub attempts: u32,
    #[serde(with = "crate::message::rfc3339_seconds")]
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(record: &SourceRecord, error: &Error, attempts: u32, failed_at: DateTime<Utc>) -> Self {
        DeadLetter {
            source_topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            original_payload: BASE64_STANDARD.encode(&record.value),
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            attempts,
            failed_at,
        }
    }

    /// Key of the dead-letter record, the source key when there was one.
    pub fn key(&self) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.partition, self.offset))
    }

    pub fn original_payload(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(&self.original_payload)
            .map_err(|e| Error::Decode(format!("dead-letter payload: {e}")))
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixed_time;

    #[test]
    fn test_dead_letter_keeps_original_payload() {
        let record = SourceRecord {
            topic: "github-issues".into(),
            partition: 3,
            offset: 12,
            key: None,
            value: Bytes::from_static(br#"{"id":1}"#),
        };
        let error = Error::Upstream {
            status: 400,
            body: "context length exceeded".into(),
        };
        let letter = DeadLetter::new(&record, &error, 5, fixed_time());

        assert_eq!(letter.key(), "3-12");
        assert_eq!(letter.error_kind, "upstream");
        assert_eq!(letter.original_payload().unwrap(), br#"{"id":1}"#);

        let value: serde_json::Value = serde_json::from_slice(&letter.encode().unwrap()).unwrap();
        assert_eq!(value["failed_at"], "2024-01-01T00:00:00Z");
        assert_eq!(value["attempts"], 5);
    }
}
