use crate::model::Watermark;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

/// Durable reader position shared by every log file.
///
/// Files are consumed in lexicographic path order: a path sorting before the
/// recorded file is finished, one sorting after it has not been started.
#[derive(Debug)]
pub struct WatermarkStore {
    path: PathBuf,
    current: Watermark,
}

impl WatermarkStore {
    /// Loads the stored watermark. A missing or unreadable file starts from
    /// the beginning.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Watermark>(&bytes) {
                Ok(watermark) => {
                    info!(
                        "resuming from watermark {}:{}",
                        watermark.file, watermark.offset
                    );
                    watermark
                }
                Err(exc) => {
                    warn!(
                        "ignoring unparseable watermark {}: {exc}; processing all logs",
                        path.display()
                    );
                    Watermark::default()
                }
            },
            Err(exc) if exc.kind() == std::io::ErrorKind::NotFound => {
                info!("no watermark at {}; processing all logs", path.display());
                Watermark::default()
            }
            Err(exc) => {
                warn!(
                    "failed to read watermark {}: {exc}; processing all logs",
                    path.display()
                );
                Watermark::default()
            }
        };

        Self { path, current }
    }

    pub fn current(&self) -> &Watermark {
        &self.current
    }

    /// Offset to resume `file` from, or `-1` when it is already done.
    pub fn offset_for(&self, file: &str) -> i64 {
        match file.cmp(self.current.file.as_str()) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Greater => 0,
            std::cmp::Ordering::Equal => self.current.offset,
        }
    }

    /// Moves the watermark forward. Returns `false` when the update would
    /// move it backwards.
    pub fn advance(&mut self, file: &str, offset: i64) -> bool {
        match file.cmp(self.current.file.as_str()) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal if offset < self.current.offset => false,
            _ => {
                self.current = Watermark {
                    file: file.to_string(),
                    offset,
                };
                true
            }
        }
    }

    /// Writes the watermark to a sibling temp file and renames it into place.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec(&self.current).context("failed to encode watermark")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
