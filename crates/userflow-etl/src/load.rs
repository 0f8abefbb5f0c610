//! Loading stage
//!
//! On every phase2 announcement: record the run, load the three artifact
//! files into their tables, then copy them to the remote store. The three
//! table loads are independent of each other, and a failed upload never
//! undoes a committed load.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use userflow_common::types::{Channel, Phase2Announcement};

use crate::bus::Subscription;
use crate::sink::{ArtifactKind, LoadOutcome, RelationalSink};
use crate::upload::{UploadReport, Uploader};

/// What happened to one artifact table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLoad {
    /// No path announced, or the file was missing or empty
    Skipped,
    Loaded(u64),
    Failed(String),
}

/// One artifact's load result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLoad {
    pub kind: ArtifactKind,
    pub path: Option<PathBuf>,
    pub status: TableLoad,
}

/// Summary of one handled announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub run_id: i64,
    pub tables: Vec<ArtifactLoad>,
    pub upload: UploadReport,
}

impl LoadReport {
    pub fn status(&self, kind: ArtifactKind) -> Option<&TableLoad> {
        self.tables.iter().find(|t| t.kind == kind).map(|t| &t.status)
    }
}

/// Event-driven loading stage
pub struct LoadingStage {
    sink: RelationalSink,
    uploader: Uploader,
}

impl LoadingStage {
    pub fn new(sink: RelationalSink, uploader: Uploader) -> Self {
        Self { sink, uploader }
    }

    pub fn sink(&self) -> &RelationalSink {
        &self.sink
    }

    /// Record, load, upload
    ///
    /// Only a failure to record the run is an error; it stops the table loads
    /// and the upload.
    #[instrument(skip_all, fields(valid = announcement.valid_count, invalid = announcement.invalid_count))]
    pub async fn handle(&self, announcement: &Phase2Announcement) -> Result<LoadReport> {
        let run_id = self
            .sink
            .record_run(announcement)
            .await
            .context("Failed to record run")?;

        let mut tables = Vec::with_capacity(3);
        for (kind, path) in ArtifactKind::all().into_iter().zip(announcement.artifacts()) {
            let status = match path {
                None => {
                    warn!(table = %kind, "No file announced, skipping table");
                    TableLoad::Skipped
                },
                Some(path) => match self.sink.load_file(path, kind).await {
                    Ok(LoadOutcome::Loaded(rows)) => TableLoad::Loaded(rows),
                    Ok(LoadOutcome::Skipped) => TableLoad::Skipped,
                    Err(e) => {
                        error!(table = %kind, path = %path.display(), error = %e, "Table load failed");
                        TableLoad::Failed(e.to_string())
                    },
                },
            };
            tables.push(ArtifactLoad {
                kind,
                path: path.map(PathBuf::from),
                status,
            });
        }

        let upload = self.uploader.upload_all(&announcement.artifacts()).await;
        if let UploadReport::ConnectFailed { attempts } = upload {
            warn!(attempts, "Artifacts loaded but not uploaded");
        }

        info!(run_id, "Loading complete");
        Ok(LoadReport {
            run_id,
            tables,
            upload,
        })
    }

    /// Subscribe loop; one message at a time until `shutdown` fires
    pub async fn run(self, mut subscription: Box<dyn Subscription>, shutdown: CancellationToken) {
        info!(channel = %Channel::Phase2Complete, "Loading stage waiting for messages");

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

            let announcement = match Phase2Announcement::from_payload(&payload) {
                Ok(a) => a,
                Err(e) => {
                    error!(error = %e, payload, "Undecodable phase2 message, skipping");
                    continue;
                },
            };

            if let Err(e) = self.handle(&announcement).await {
                error!(error = ?e, "Loading failed, message dropped");
            }
        }

        info!("Loading stage stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::upload::tests::FakeRemote;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn stage(remote: Arc<FakeRemote>) -> LoadingStage {
        let sink = RelationalSink::connect("sqlite::memory:").await.unwrap();
        LoadingStage::new(sink, Uploader::new(remote, RetryPolicy::fixed(5, Duration::from_millis(1))))
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_handle_loads_and_uploads_everything() {
        let dir = TempDir::new().unwrap();
        let raw = write(dir.path(), "records_1.jsonl", "{\"id\":1}\n{\"id\":2}\n");
        let processed = write(dir.path(), "etl_1.jsonl", "{\"id\":1,\"department_code\":\"SAL\"}\n");
        let dlq = write(dir.path(), "invalid_users_1.jsonl", "{\"id\":2,\"error_reason\":\"x\"}\n");

        let remote = Arc::new(FakeRemote::default());
        let stage = stage(remote.clone()).await;

        let report = stage
            .handle(&Phase2Announcement::new(&raw, &processed, &dlq, 1, 1))
            .await
            .unwrap();

        assert_eq!(report.status(ArtifactKind::Raw), Some(&TableLoad::Loaded(2)));
        assert_eq!(report.status(ArtifactKind::Processed), Some(&TableLoad::Loaded(1)));
        assert_eq!(report.status(ArtifactKind::DeadLetter), Some(&TableLoad::Loaded(1)));
        assert_eq!(report.upload.uploaded().len(), 3);
        assert_eq!(stage.sink().list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_bad_file_does_not_block_the_others() {
        let dir = TempDir::new().unwrap();
        let raw = write(dir.path(), "records_1.jsonl", "not json\n");
        let processed = write(dir.path(), "etl_1.jsonl", "{\"id\":1}\n");
        let dlq = write(dir.path(), "invalid_users_1.jsonl", "");

        let stage = stage(Arc::new(FakeRemote::default())).await;
        let report = stage
            .handle(&Phase2Announcement::new(&raw, &processed, &dlq, 1, 0))
            .await
            .unwrap();

        assert!(matches!(report.status(ArtifactKind::Raw), Some(TableLoad::Failed(_))));
        assert_eq!(report.status(ArtifactKind::Processed), Some(&TableLoad::Loaded(1)));
        assert_eq!(report.status(ArtifactKind::DeadLetter), Some(&TableLoad::Skipped));
    }

    #[tokio::test]
    async fn test_upload_exhaustion_keeps_committed_rows() {
        let dir = TempDir::new().unwrap();
        let raw = write(dir.path(), "records_1.jsonl", "{\"id\":1}\n");
        let processed = write(dir.path(), "etl_1.jsonl", "{\"id\":1}\n");
        let dlq = write(dir.path(), "invalid_users_1.jsonl", "");

        let remote = Arc::new(FakeRemote {
            failures: u32::MAX,
            ..Default::default()
        });
        let stage = stage(remote.clone()).await;

        let report = stage
            .handle(&Phase2Announcement::new(&raw, &processed, &dlq, 1, 0))
            .await
            .unwrap();

        assert_eq!(report.upload, UploadReport::ConnectFailed { attempts: 5 });
        assert_eq!(remote.connects.load(Ordering::SeqCst), 5);
        assert_eq!(stage.sink().row_count(ArtifactKind::Raw).await.unwrap(), 1);
        assert_eq!(stage.sink().row_count(ArtifactKind::Processed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_record_stops_loads_and_upload() {
        let dir = TempDir::new().unwrap();
        let raw = write(dir.path(), "records_1.jsonl", "{\"id\":1}\n");
        let processed = write(dir.path(), "etl_1.jsonl", "{\"id\":1}\n");
        let dlq = write(dir.path(), "invalid_users_1.jsonl", "");

        let remote = Arc::new(FakeRemote::default());
        let stage = stage(remote.clone()).await;
        sqlx::query("DROP TABLE etl_runs")
            .execute(stage.sink().pool())
            .await
            .unwrap();

        let result = stage
            .handle(&Phase2Announcement::new(&raw, &processed, &dlq, 1, 0))
            .await;

        assert!(result.is_err());
        assert_eq!(stage.sink().row_count(ArtifactKind::Raw).await.unwrap(), 0);
        assert_eq!(stage.sink().row_count(ArtifactKind::Processed).await.unwrap(), 0);
        assert_eq!(remote.connects.load(Ordering::SeqCst), 0);
    }
}
