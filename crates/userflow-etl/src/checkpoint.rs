//! Durable pagination cursor
//!
//! The extraction stage is the only writer. The stored form is a single JSON
//! object `{"last_skip": n}`; a missing or unreadable file means "start from
//! zero" and is never fatal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Offset of the next unread record in the source collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "last_skip")]
    pub cursor: u64,
}

impl Checkpoint {
    pub const START: Checkpoint = Checkpoint { cursor: 0 };

    pub fn new(cursor: u64) -> Self {
        Self { cursor }
    }

    pub fn advanced_by(self, records: u64) -> Self {
        Self {
            cursor: self.cursor + records,
        }
    }
}

/// Persistence for the extraction cursor
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last saved checkpoint, or [`Checkpoint::START`] if none is readable
    async fn load(&self) -> Checkpoint;

    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;
}

/// Checkpoint kept in a JSON file on local disk
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Checkpoint {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint file, starting from zero");
                return Checkpoint::START;
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Can't read checkpoint file, starting from zero");
                return Checkpoint::START;
            },
        };

        match serde_json::from_str::<Checkpoint>(&contents) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed checkpoint file, starting from zero");
                Checkpoint::START
            },
        }
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create checkpoint directory {}", parent.display()))?;
        }

        // Readers only ever see a complete file.
        let tmp = self.temp_path();
        let body = serde_json::to_vec(&checkpoint)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace checkpoint {}", self.path.display()))?;

        debug!(cursor = checkpoint.cursor, "Checkpoint saved");
        Ok(())
    }
}

/// In-memory store that remembers every save, for dry runs and tests
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<(Checkpoint, Vec<Checkpoint>)>,
}

impl MemoryCheckpointStore {
    pub fn starting_at(checkpoint: Checkpoint) -> Self {
        Self {
            state: Mutex::new((checkpoint, Vec::new())),
        }
    }

    /// Every checkpoint passed to `save`, oldest first
    pub fn history(&self) -> Vec<Checkpoint> {
        self.state
            .lock()
            .map(|guard| guard.1.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Checkpoint {
        self.state.lock().map(|guard| guard.0).unwrap_or_default()
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint lock poisoned"))?;
        guard.0 = checkpoint;
        guard.1.push(checkpoint);
        Ok(())
    }
}
