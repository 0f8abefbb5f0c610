//! Types shared between pipeline stages
//!
//! Stages never call each other directly. Extraction announces a finished raw
//! batch on [`Channel::Phase1Complete`], transformation announces its outputs
//! on [`Channel::Phase2Complete`], and each announcement is a small JSON
//! document naming files on the shared filesystem.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Named publish/subscribe topics connecting the stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Extraction → Transformation
    Phase1Complete,
    /// Transformation → Loading
    Phase2Complete,
}

impl Channel {
    /// Wire name of the channel
    pub fn name(self) -> &'static str {
        match self {
            Channel::Phase1Complete => "channel:phase1_complete",
            Channel::Phase2Complete => "channel:phase2_complete",
        }
    }

    /// All channels, in pipeline order
    pub fn all() -> [Channel; 2] {
        [Channel::Phase1Complete, Channel::Phase2Complete]
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::error::UserflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Channel::all()
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| crate::error::UserflowError::bus(format!("Unknown channel: {}", s)))
    }
}

/// Announcement published when a raw batch file is complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Announcement {
    pub raw_file: PathBuf,
}

impl Phase1Announcement {
    pub fn new(raw_file: impl Into<PathBuf>) -> Self {
        Self {
            raw_file: raw_file.into(),
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Announcement published when a raw batch has been split into processed and
/// dead-letter outputs
///
/// File paths are optional when decoding so that a loader can skip artifacts
/// an upstream producer did not name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase2Announcement {
    #[serde(default)]
    pub raw_file: Option<PathBuf>,
    #[serde(default)]
    pub processed_file: Option<PathBuf>,
    #[serde(default)]
    pub dlq_file: Option<PathBuf>,
    #[serde(default)]
    pub valid_count: u64,
    #[serde(default)]
    pub invalid_count: u64,
}

impl Phase2Announcement {
    pub fn new(
        raw_file: impl Into<PathBuf>,
        processed_file: impl Into<PathBuf>,
        dlq_file: impl Into<PathBuf>,
        valid_count: u64,
        invalid_count: u64,
    ) -> Self {
        Self {
            raw_file: Some(raw_file.into()),
            processed_file: Some(processed_file.into()),
            dlq_file: Some(dlq_file.into()),
            valid_count,
            invalid_count,
        }
    }

    /// Total number of lines the transformation read
    pub fn total_count(&self) -> u64 {
        self.valid_count + self.invalid_count
    }

    /// Artifact paths in load order: raw, processed, dead-letter
    pub fn artifacts(&self) -> [Option<&Path>; 3] {
        [
            self.raw_file.as_deref(),
            self.processed_file.as_deref(),
            self.dlq_file.as_deref(),
        ]
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Phase1Complete.name(), "channel:phase1_complete");
        assert_eq!(Channel::Phase2Complete.to_string(), "channel:phase2_complete");
        assert_eq!(
            "channel:phase2_complete".parse::<Channel>().unwrap(),
            Channel::Phase2Complete
        );
        assert!("channel:nope".parse::<Channel>().is_err());
    }

    #[test]
    fn test_phase1_wire_format() {
        let announcement = Phase1Announcement::new("data/raw_users/records_1.jsonl");
        let payload = announcement.to_payload().unwrap();
        assert_eq!(payload, r#"{"raw_file":"data/raw_users/records_1.jsonl"}"#);
    }

    #[test]
    fn test_phase2_missing_paths_decode_as_none() {
        let decoded =
            Phase2Announcement::from_payload(r#"{"raw_file":"r.jsonl","valid_count":3}"#).unwrap();
        assert_eq!(decoded.raw_file, Some(PathBuf::from("r.jsonl")));
        assert_eq!(decoded.processed_file, None);
        assert_eq!(decoded.dlq_file, None);
        assert_eq!(decoded.valid_count, 3);
        assert_eq!(decoded.invalid_count, 0);
    }

    #[test]
    fn test_phase2_total_count() {
        let announcement = Phase2Announcement::new("r", "p", "d", 7, 3);
        assert_eq!(announcement.total_count(), 10);
        assert_eq!(announcement.artifacts()[1], Some(Path::new("p")));
    }
}
