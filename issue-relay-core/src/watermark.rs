use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Watermark persisted as a JSON file.
pub mod file;

/// Lower bound of the next fetch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    pub since: DateTime<Utc>,
}

impl Watermark {
    pub fn new(since: DateTime<Utc>) -> Self {
        Watermark { since }
    }

    /// Moves forward to `to`, never back.
    pub fn advance(self, to: DateTime<Utc>) -> Self {
        Watermark {
            since: self.since.max(to),
        }
    }
}

/// Keeps the watermark across cycles, and across restarts when the store is durable.
#[trait_variant::make(WatermarkStore: Send)]
pub trait LocalWatermarkStore {
    /// Last stored watermark, `None` on first start.
    async fn load(&self) -> Result<Option<Watermark>>;

    /// Replaces the stored watermark. Fails when `watermark` is older than the stored one.
    async fn store(&self, watermark: Watermark) -> Result<()>;
}

pub(crate) fn reject_backwards(current: Option<Watermark>, next: Watermark) -> Result<()> {
    match current {
        Some(current) if next < current => Err(Error::Watermark(format!(
            "refusing to move watermark back from {} to {}",
            current.since, next.since
        ))),
        _ => Ok(()),
    }
}

/// Process-local store, the watermark starts over on restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWatermarkStore {
    current: Arc<parking_lot::Mutex<Option<Watermark>>>,
}

impl InMemoryWatermarkStore {
    pub fn new(initial: Option<Watermark>) -> Self {
        InMemoryWatermarkStore {
            current: Arc::new(parking_lot::Mutex::new(initial)),
        }
    }
}

impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>> {
        Ok(*self.current.lock())
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        let mut current = self.current.lock();
        reject_backwards(*current, watermark)?;
        *current = Some(watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use super::{InMemoryWatermarkStore, Watermark, WatermarkStore};

    #[test]
    fn test_advance_never_moves_back() {
        let now = Utc::now();
        let wm = Watermark::new(now);
        assert_eq!(wm.advance(now - TimeDelta::hours(1)), wm);
        assert_eq!(wm.advance(now + TimeDelta::hours(1)).since, now + TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_in_memory_store_is_monotonic() {
        let now = Utc::now();
        let store = InMemoryWatermarkStore::default();
        assert_eq!(store.load().await.unwrap(), None);

        store.store(Watermark::new(now)).await.unwrap();
        let err = store
            .store(Watermark::new(now - TimeDelta::seconds(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "watermark");
        assert_eq!(store.load().await.unwrap(), Some(Watermark::new(now)));
    }
}
