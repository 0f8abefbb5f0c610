//! Transformation stage
//!
//! Streams a raw batch file line by line. Each line is decoded, validated and
//! routed: valid records gain a `department_code` and go to the processed
//! file; everything else goes to the dead-letter file with an
//! `error_reason`. One bad line never stops the batch.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use userflow_common::types::{Channel, Phase1Announcement, Phase2Announcement};

use crate::bus::{announce_phase2, EventBus, Subscription};
use crate::extract::batch_stamp;
use crate::lookup::DepartmentLookup;
use crate::validate::validate;

/// Reason recorded for lines that are not JSON at all
pub const MALFORMED_INPUT_REASON: &str = "malformed input";

/// Where the transformation writes its outputs
#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub processed_dir: PathBuf,
    pub dlq_dir: PathBuf,
}

/// Outcome of routing a single raw line
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Valid(Map<String, Value>),
    Invalid(Map<String, Value>),
}

/// Decode, validate, and enrich one raw line
pub fn route_line(line: &str, lookup: &DepartmentLookup) -> Routed {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return Routed::Invalid(dead_letter_line(line, MALFORMED_INPUT_REASON));
        },
    };

    match validate(&value) {
        Ok(record) => {
            let code = lookup.code_for(&record.department).to_string();
            Routed::Valid(record.into_enriched(&code))
        },
        Err(e) => match value {
            Value::Object(mut obj) => {
                obj.insert("error_reason".to_string(), Value::String(e.reason()));
                Routed::Invalid(obj)
            },
            _ => Routed::Invalid(dead_letter_line(line, &e.reason())),
        },
    }
}

fn dead_letter_line(line: &str, reason: &str) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("raw_line".to_string(), json!(line));
    obj.insert("error_reason".to_string(), json!(reason));
    obj
}

/// Route raw bytes; a line that is not UTF-8 is malformed input
fn route_bytes(line: &[u8], lookup: &DepartmentLookup) -> Routed {
    match std::str::from_utf8(line) {
        Ok(line) => route_line(line, lookup),
        Err(_) => Routed::Invalid(dead_letter_line(
            &String::from_utf8_lossy(line),
            MALFORMED_INPUT_REASON,
        )),
    }
}

fn strip_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

async fn open_output(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

async fn write_json_line(out: &mut BufWriter<File>, obj: &Map<String, Value>) -> Result<()> {
    let mut line = serde_json::to_vec(obj)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    Ok(())
}

async fn finish(mut out: BufWriter<File>, path: &Path) -> Result<()> {
    out.flush()
        .await
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    out.get_ref()
        .sync_data()
        .await
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

/// Event-driven transformation stage
pub struct TransformationStage {
    lookup: Arc<DepartmentLookup>,
    bus: Arc<dyn EventBus>,
    settings: TransformSettings,
}

impl TransformationStage {
    /// The lookup must already be loaded; without it the stage cannot run
    pub fn new(lookup: Arc<DepartmentLookup>, bus: Arc<dyn EventBus>, settings: TransformSettings) -> Self {
        Self {
            lookup,
            bus,
            settings,
        }
    }

    /// Output file paths for a batch processed now
    ///
    /// Both are created with `create_new`; an existing file is an error, never
    /// appended to.
    pub fn output_paths(&self) -> (PathBuf, PathBuf) {
        let timestamp = batch_stamp();
        (
            self.settings.processed_dir.join(format!("etl_{}.jsonl", timestamp)),
            self.settings
                .dlq_dir
                .join(format!("invalid_users_{}.jsonl", timestamp)),
        )
    }

    /// Split one raw file into processed and dead-letter outputs
    ///
    /// Both outputs are always created. Fails only when the raw file cannot be
    /// opened or an output cannot be written; bad lines are never errors.
    #[instrument(skip(self, raw_file), fields(raw_file = %raw_file.display()))]
    pub async fn process_file(&self, raw_file: &Path) -> Result<Phase2Announcement> {
        info!("Processing raw file");

        let raw = File::open(raw_file)
            .await
            .with_context(|| format!("Failed to open raw file {}", raw_file.display()))?;

        let (processed_path, dlq_path) = self.output_paths();
        let mut processed = open_output(&processed_path).await?;
        let mut dlq = open_output(&dlq_path).await?;

        let mut valid_count: u64 = 0;
        let mut invalid_count: u64 = 0;

        let mut reader = BufReader::new(raw);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .with_context(|| format!("Failed to read {}", raw_file.display()))?;
            if read == 0 {
                break;
            }

            match route_bytes(strip_line_ending(&buf), &self.lookup) {
                Routed::Valid(obj) => {
                    write_json_line(&mut processed, &obj).await?;
                    valid_count += 1;
                },
                Routed::Invalid(obj) => {
                    if obj.contains_key("raw_line") {
                        warn!(line_number = valid_count + invalid_count + 1, "Malformed line routed to dead-letter file");
                    }
                    write_json_line(&mut dlq, &obj).await?;
                    invalid_count += 1;
                },
            }
        }

        finish(processed, &processed_path).await?;
        finish(dlq, &dlq_path).await?;

        info!(valid = valid_count, invalid = invalid_count, "Raw file processed");

        Ok(Phase2Announcement::new(
            raw_file,
            processed_path,
            dlq_path,
            valid_count,
            invalid_count,
        ))
    }

    /// Handle one phase1 payload end to end
    ///
    /// Returns the published announcement, or `None` when the message was
    /// dropped (undecodable payload, missing raw file, I/O failure).
    pub async fn handle(&self, payload: &str) -> Option<Phase2Announcement> {
        let announcement = match Phase1Announcement::from_payload(payload) {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, payload, "Undecodable phase1 message, skipping");
                return None;
            },
        };

        if !tokio::fs::try_exists(&announcement.raw_file)
            .await
            .unwrap_or(false)
        {
            error!(raw_file = %announcement.raw_file.display(), "Raw file not found, skipping");
            return None;
        }

        let result = match self.process_file(&announcement.raw_file).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = ?e, "Transformation failed, batch dropped");
                return None;
            },
        };

        match announce_phase2(self.bus.as_ref(), &result).await {
            Ok(receivers) => info!(receivers, "Phase2 announced"),
            Err(e) => error!(error = %e, "Failed to announce phase2"),
        }

        Some(result)
    }

    /// Subscribe loop; one message at a time until `shutdown` fires
    pub async fn run(self, mut subscription: Box<dyn Subscription>, shutdown: CancellationToken) {
        info!(channel = %Channel::Phase1Complete, "Transformation stage waiting for messages");

        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscription.next_message() => match message {
                    Some(payload) => payload,
                    None => {
                        warn!("Event bus closed");
                        break;
                    },
                },
            };

            self.handle(&payload).await;
        }

        info!("Transformation stage stopped");
    }
}
