//! Extraction stage
//!
//! Pulls the source collection page by page from the persisted cursor,
//! appends each page to the cycle's raw batch file, and moves the cursor only
//! after the page is on disk. When a full pass completes the cursor resets to
//! zero and, if anything was written, the raw file is announced on
//! `channel:phase1_complete`.
//!
//! The source's `total` is read from the first page of a cycle and not
//! re-checked. Records appended upstream mid-cycle are picked up by the next
//! pass.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use userflow_common::types::Phase1Announcement;

use crate::bus::{announce_phase1, EventBus};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::fetcher::{FetchError, Page, PageSource};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// How an extraction cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The pass over the source finished and the cursor was reset
    Completed,
    /// A page fetch ran out of retries; the cursor stays where it was saved
    Aborted { attempts: u32 },
}

/// Summary of one extraction cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub records_written: u64,
    /// Raw batch file, if at least one page was written
    pub raw_file: Option<PathBuf>,
    /// Checkpoint the next cycle should start from
    pub next: Checkpoint,
    /// Whether a phase1 announcement went out
    pub announced: bool,
}

/// Extraction stage settings
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub raw_dir: PathBuf,
    pub batch_size: u64,
    pub interval: Duration,
    pub retry: RetryPolicy,
}

/// Append-only raw batch file, opened on first write
struct BatchWriter {
    path: PathBuf,
    file: Option<File>,
}

impl BatchWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    async fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("Failed to open {}", self.path.display()))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("batch file not open"))
    }

    /// Append records as JSON lines and sync them to disk
    async fn append(&mut self, records: &[Value]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.path.clone();
        let file = self.open().await?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush().await?;
        file.sync_data()
            .await
            .with_context(|| format!("Failed to sync {}", path.display()))?;
        Ok(())
    }

    fn created(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|_| self.path.clone())
    }
}

/// Timestamp used in batch file names, down to the microsecond
pub fn batch_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

/// Raw batch file name for a cycle starting now
///
/// The file is created with `create_new`, so a name collision fails the cycle
/// instead of mixing two batches.
pub fn raw_file_name(raw_dir: &Path) -> PathBuf {
    raw_dir.join(format!("records_{}.jsonl", batch_stamp()))
}

/// Timer-driven extraction stage
pub struct ExtractionStage {
    source: Arc<dyn PageSource>,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn EventBus>,
    settings: ExtractionSettings,
}

impl ExtractionStage {
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn CheckpointStore>,
        bus: Arc<dyn EventBus>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            source,
            store,
            bus,
            settings,
        }
    }

    async fn fetch_with_retry(&self, skip: u64) -> std::result::Result<Page, crate::retry::RetryError<FetchError>> {
        let limit = self.settings.batch_size;
        retry_with_backoff(
            &self.settings.retry,
            "fetch_page",
            |_| self.source.fetch_page(skip, limit),
            FetchError::is_retryable,
        )
        .await
    }

    /// Run one extraction cycle starting at `start`
    ///
    /// Every successfully written page is checkpointed before the next fetch.
    /// An I/O failure while writing or saving returns `Err` with the cursor
    /// still at the last saved value.
    #[instrument(skip(self), fields(start = start.cursor))]
    pub async fn run_cycle(&self, start: Checkpoint) -> Result<CycleReport> {
        info!("Starting extraction cycle");

        let mut writer = BatchWriter::new(raw_file_name(&self.settings.raw_dir));
        let mut cursor = start;
        let mut total: Option<u64> = None;
        let mut written: u64 = 0;

        loop {
            info!(limit = self.settings.batch_size, skip = cursor.cursor, "Requesting page");

            let page = match self.fetch_with_retry(cursor.cursor).await {
                Ok(page) => page,
                Err(e) => {
                    error!(skip = cursor.cursor, error = %e, "Extraction aborted, cursor left unchanged");
                    return Ok(CycleReport {
                        outcome: CycleOutcome::Aborted {
                            attempts: e.attempts(),
                        },
                        records_written: written,
                        raw_file: writer.created(),
                        next: cursor,
                        announced: false,
                    });
                },
            };

            let total = *total.get_or_insert_with(|| {
                info!(total = page.total, "Records to extract");
                page.total
            });

            if page.users.is_empty() {
                info!("No more records, pagination complete");
                break;
            }

            writer.append(&page.users).await?;

            let received = page.users.len() as u64;
            cursor = cursor.advanced_by(received);
            written += received;

            if cursor.cursor >= total {
                info!(progress = cursor.cursor, total, "Pass complete");
                break;
            }

            self.store.save(cursor).await?;
            info!(progress = cursor.cursor, total, "Page saved");
        }

        self.store.save(Checkpoint::START).await?;
        info!(records = written, "Extraction complete, cursor reset for the next pass");

        let raw_file = writer.created();
        let announced = match raw_file.as_ref().filter(|_| written > 0) {
            Some(path) => self.announce(path).await,
            None => {
                info!("No new records, nothing announced");
                false
            },
        };

        Ok(CycleReport {
            outcome: CycleOutcome::Completed,
            records_written: written,
            raw_file,
            next: Checkpoint::START,
            announced,
        })
    }

    async fn announce(&self, raw_file: &Path) -> bool {
        match announce_phase1(self.bus.as_ref(), &Phase1Announcement::new(raw_file)).await {
            Ok(receivers) => {
                info!(raw_file = %raw_file.display(), receivers, "Phase1 announced");
                true
            },
            Err(e) => {
                error!(raw_file = %raw_file.display(), error = %e, "Failed to announce phase1");
                false
            },
        }
    }

    /// Run cycles on a fixed interval until `shutdown` fires
    ///
    /// Cycles never overlap; a cycle in progress finishes before shutdown is
    /// honored.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.settings.interval.as_secs(), "Extraction stage started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let start = self.store.load().await;
            match self.run_cycle(start).await {
                Ok(report) if report.outcome == CycleOutcome::Completed => {
                    info!(records = report.records_written, "Extraction cycle succeeded");
                },
                Ok(report) => {
                    warn!(next = report.next.cursor, "Extraction cycle aborted, will retry next tick");
                },
                Err(e) => {
                    error!(error = ?e, "Extraction cycle failed, will retry next tick");
                },
            }
        }

        info!("Extraction stage stopped");
    }
}
