use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::watermark::{Watermark, WatermarkStore, reject_backwards};

/// Stores `{"since": "<RFC3339>"}` in a file. Writes go to a sibling temp file which is then
/// renamed over the target, so a crash leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileWatermarkStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Watermark(format!(
                    "Reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| Error::Watermark(format!("Parsing {}: {e}", self.path.display())))
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        reject_backwards(self.load().await?, watermark)?;

        let value = serde_json::to_vec(&watermark)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Error::Watermark(format!("Writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::Watermark(format!("Renaming {} into place: {e}", tmp.display()))
        })?;

        debug!(path = %self.path.display(), since = %watermark.since, "Persisted watermark");
        Ok(())
    }
}
