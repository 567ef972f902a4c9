//! Durable progress marker for the reconciler.
//!
//! The checkpoint records the timestamp of the last log line that was applied.
//! On restart, lines at or before it are skipped so the log can be re-read from
//! the start without applying anything twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("checkpoint {path} is not valid: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerCheckpoint {
    pub last_processed_time: DateTime<Utc>,
}

/// JSON file holding a [`ReconcilerCheckpoint`]. Single writer.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<ReconcilerCheckpoint, CheckpointError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Format {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the checkpoint, starting from now when it is missing or unreadable.
    pub async fn load_or_now(&self) -> ReconcilerCheckpoint {
        match self.load().await {
            Ok(checkpoint) => {
                log::info!(
                    "reconciler: resuming after {}",
                    checkpoint.last_processed_time.to_rfc3339()
                );
                checkpoint
            }
            Err(CheckpointError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                log::info!("reconciler: no checkpoint at {}, starting from now", self.path.display());
                ReconcilerCheckpoint {
                    last_processed_time: Utc::now(),
                }
            }
            Err(e) => {
                log::warn!("reconciler: {}, starting from now", e);
                ReconcilerCheckpoint {
                    last_processed_time: Utc::now(),
                }
            }
        }
    }

    /// Write the checkpoint through a temporary file so a crash never leaves a
    /// truncated checkpoint behind.
    pub async fn save(&self, checkpoint: &ReconcilerCheckpoint) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Format {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}
