//! Remote file drop
//!
//! Copies a run's artifacts to the remote store by basename. The store is a
//! trait so the loading stage can be exercised without a server;
//! [`FtpRemoteStore`] is the production implementation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suppaftp::FtpStream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RemoteConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Connects to the remote store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>>;
}

/// One authenticated session positioned in the upload directory
#[async_trait]
pub trait RemoteSession: Send {
    /// Upload `local` as `remote_name`, returning bytes written
    async fn put(&mut self, local: &Path, remote_name: &str) -> Result<u64>;

    async fn close(self: Box<Self>);
}

/// FTP-backed remote store
#[derive(Debug, Clone)]
pub struct FtpRemoteStore {
    config: RemoteConfig,
}

impl FtpRemoteStore {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn resolve(config: &RemoteConfig) -> Result<SocketAddr> {
        (config.host.as_str(), config.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", config.host, config.port))?
            .next()
            .ok_or_else(|| anyhow!("No address found for {}:{}", config.host, config.port))
    }

    fn connect_sync(config: &RemoteConfig) -> Result<FtpStream> {
        let addr = Self::resolve(config)?;
        debug!("Connecting to FTP server: {} ({})", config.host, addr);

        let mut ftp_stream = FtpStream::connect_timeout(addr, config.connect_timeout())
            .context("Failed to connect to FTP server")?;

        ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

        debug!("Logging in as: {}", config.username);
        ftp_stream
            .login(&config.username, &config.password)
            .context("Failed to login to FTP server")?;

        ftp_stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .context("Failed to set binary mode")?;

        ftp_stream
            .cwd(&config.remote_dir)
            .with_context(|| format!("Failed to change to remote directory {}", config.remote_dir))?;

        Ok(ftp_stream)
    }
}

#[async_trait]
impl RemoteStore for FtpRemoteStore {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        let config = self.config.clone();
        let stream = tokio::task::spawn_blocking(move || Self::connect_sync(&config))
            .await
            .map_err(|e| anyhow!("FTP connect task panicked: {}", e))??;

        Ok(Box::new(FtpSession {
            stream: Some(stream),
        }))
    }
}

/// Session over a blocking FTP stream; each call hops onto a blocking thread
struct FtpSession {
    stream: Option<FtpStream>,
}

#[async_trait]
impl RemoteSession for FtpSession {
    async fn put(&mut self, local: &Path, remote_name: &str) -> Result<u64> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("FTP session is no longer usable"))?;
        let local = local.to_path_buf();
        let remote_name = remote_name.to_string();

        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = File::open(&local)
                .with_context(|| format!("Failed to open {}", local.display()))
                .and_then(|mut file| {
                    stream
                        .put_file(&remote_name, &mut file)
                        .with_context(|| format!("Failed to upload {}", remote_name))
                });
            (stream, result)
        })
        .await
        .map_err(|e| anyhow!("FTP upload task panicked: {}", e))?;

        self.stream = Some(stream);
        result
    }

    async fn close(self: Box<Self>) {
        let Some(mut stream) = self.stream else {
            return;
        };
        let quit = tokio::task::spawn_blocking(move || stream.quit()).await;
        match quit {
            Ok(Ok(())) => debug!("FTP session closed"),
            Ok(Err(e)) => warn!("Failed to quit FTP session gracefully: {}", e),
            Err(e) => warn!("FTP quit task panicked: {}", e),
        }
    }
}

/// Files uploaded, skipped, and failed in one upload pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: Vec<String>,
    pub missing: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Outcome of [`Uploader::upload_all`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadReport {
    /// No session could be opened; nothing was uploaded
    ConnectFailed { attempts: u32 },
    Finished(UploadSummary),
}

impl UploadReport {
    pub fn uploaded(&self) -> &[String] {
        match self {
            UploadReport::Finished(summary) => &summary.uploaded,
            UploadReport::ConnectFailed { .. } => &[],
        }
    }
}

/// Uploads artifacts through a [`RemoteStore`] with connection retries
pub struct Uploader {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Upload every existing file by basename over a single session
    ///
    /// Never fails: connection exhaustion and per-file errors are logged and
    /// reported.
    #[instrument(skip_all)]
    pub async fn upload_all(&self, files: &[Option<&Path>]) -> UploadReport {
        let connected = retry_with_backoff(
            &self.policy,
            "remote connect",
            |_| self.store.connect(),
            |_| true,
        )
        .await;

        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Could not connect to remote store, upload skipped");
                return UploadReport::ConnectFailed {
                    attempts: e.attempts(),
                };
            },
        };

        let mut summary = UploadSummary::default();
        for path in files.iter().flatten() {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                warn!(path = %path.display(), "File not found, not uploading");
                summary.missing.push(path.to_path_buf());
                continue;
            }

            let Some(remote_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                warn!(path = %path.display(), "Path has no file name, not uploading");
                summary.missing.push(path.to_path_buf());
                continue;
            };

            match session.put(path, &remote_name).await {
                Ok(bytes) => {
                    info!(file = %remote_name, bytes, "Uploaded");
                    summary.uploaded.push(remote_name);
                },
                Err(e) => {
                    error!(file = %remote_name, error = ?e, "Upload failed");
                    summary.failed.push(path.to_path_buf());
                },
            }
        }

        session.close().await;
        UploadReport::Finished(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory remote that refuses the first `failures` connections
    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub failures: u32,
        pub connects: AtomicU32,
        pub files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        pub closed: Arc<AtomicU32>,
        pub reject: Vec<String>,
    }

    struct FakeSession {
        files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        closed: Arc<AtomicU32>,
        reject: Vec<String>,
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(FakeSession {
                files: self.files.clone(),
                closed: self.closed.clone(),
                reject: self.reject.clone(),
            }))
        }
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn put(&mut self, local: &Path, remote_name: &str) -> Result<u64> {
            if self.reject.iter().any(|r| r == remote_name) {
                return Err(anyhow!("permission denied"));
            }
            let data = std::fs::read(local)?;
            let len = data.len() as u64;
            self.files.lock().unwrap().push((remote_name.to_string(), data));
            Ok(len)
        }

        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(5, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_uploads_by_basename_and_skips_missing() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("records_1.jsonl");
        std::fs::write(&raw, "{}\n").unwrap();
        let gone = dir.path().join("gone.jsonl");

        let remote = Arc::new(FakeRemote::default());
        let uploader = Uploader::new(remote.clone(), policy());

        let report = uploader.upload_all(&[Some(raw.as_path()), None, Some(gone.as_path())]).await;
        let UploadReport::Finished(summary) = report else {
            panic!("expected finished report");
        };
        assert_eq!(summary.uploaded, vec!["records_1.jsonl".to_string()]);
        assert_eq!(summary.missing, vec![gone]);
        assert_eq!(remote.files.lock().unwrap()[0].1, b"{}\n");
        assert_eq!(remote.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_failed_file_does_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        let remote = Arc::new(FakeRemote {
            reject: vec!["a.jsonl".to_string()],
            ..Default::default()
        });
        let uploader = Uploader::new(remote.clone(), policy());

        let UploadReport::Finished(summary) = uploader.upload_all(&[Some(a.as_path()), Some(b.as_path())]).await else {
            panic!("expected finished report");
        };
        assert_eq!(summary.uploaded, vec!["b.jsonl".to_string()]);
        assert_eq!(summary.failed, vec![a]);
        assert_eq!(remote.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let remote = Arc::new(FakeRemote {
            failures: 2,
            ..Default::default()
        });
        let uploader = Uploader::new(remote.clone(), policy());

        let started = tokio::time::Instant::now();
        let report = uploader.upload_all(&[]).await;

        assert!(matches!(report, UploadReport::Finished(_)));
        assert_eq!(remote.connects.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhaustion_is_reported() {
        let remote = Arc::new(FakeRemote {
            failures: u32::MAX,
            ..Default::default()
        });
        let uploader = Uploader::new(remote.clone(), policy());

        let started = tokio::time::Instant::now();
        let report = uploader.upload_all(&[]).await;

        assert_eq!(report, UploadReport::ConnectFailed { attempts: 5 });
        assert_eq!(remote.connects.load(Ordering::SeqCst), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert!(report.uploaded().is_empty());
    }

    #[test]
    fn test_resolve_uses_configured_port() {
        let mut config = crate::config::Config::default().remote;
        config.host = "127.0.0.1".to_string();
        config.port = 2121;
        assert_eq!(FtpRemoteStore::resolve(&config).unwrap(), "127.0.0.1:2121".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_within_connect_timeout() {
        let mut config = crate::config::Config::default().remote;
        config.host = "10.255.255.1".to_string();
        config.connect_timeout_secs = 1;
        let store = FtpRemoteStore::new(config);

        let attempt = tokio::time::timeout(Duration::from_secs(5), store.connect()).await;
        assert!(matches!(attempt, Ok(Err(_))));
    }
}
