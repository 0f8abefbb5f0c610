//! Pipeline runner
//!
//! Wires the three stages to one bus and runs each as its own task. Both
//! subscribers are attached before extraction starts so the first phase1
//! message has somewhere to go.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use userflow_common::types::Channel;

use crate::bus::{BroadcastBus, EventBus};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::Config;
use crate::extract::{ExtractionSettings, ExtractionStage};
use crate::fetcher::{HttpPageSource, PageSource};
use crate::load::LoadingStage;
use crate::lookup::DepartmentLookup;
use crate::sink::RelationalSink;
use crate::transform::{TransformSettings, TransformationStage};
use crate::upload::{FtpRemoteStore, RemoteStore, Uploader};

/// External collaborators the stages talk to
pub struct Components {
    pub source: Arc<dyn PageSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub lookup: Arc<DepartmentLookup>,
    pub sink: RelationalSink,
    pub remote: Arc<dyn RemoteStore>,
    pub bus: Arc<dyn EventBus>,
}

impl Components {
    /// Production wiring: HTTP source, file checkpoint, SQLite, FTP
    ///
    /// Fails if the lookup table or the database cannot be opened.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source = HttpPageSource::new(&config.extract.api_base_url, config.extract.http_timeout())?;
        let lookup = DepartmentLookup::from_csv_path(&config.paths.lookup_file)
            .context("Department lookup is required by the transformation stage")?;
        let sink = RelationalSink::connect(&config.database.url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;

        Ok(Self {
            source: Arc::new(source),
            checkpoints: Arc::new(FileCheckpointStore::new(&config.extract.state_file)),
            lookup: Arc::new(lookup),
            sink,
            remote: Arc::new(FtpRemoteStore::new(config.remote.clone())),
            bus: Arc::new(BroadcastBus::new()),
        })
    }
}

/// Running pipeline
pub struct PipelineHandle {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineHandle {
    /// Ask every stage to stop after its in-flight work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all stages to exit
    pub async fn wait(self) {
        for (stage, task) in self.tasks {
            if let Err(e) = task.await {
                error!(stage, error = %e, "Stage task panicked");
            }
        }
        info!("Pipeline stopped");
    }
}

/// Subscribe the consumers, then start all three stages
pub async fn start(config: &Config, components: Components, shutdown: CancellationToken) -> Result<PipelineHandle> {
    let Components {
        source,
        checkpoints,
        lookup,
        sink,
        remote,
        bus,
    } = components;

    let phase1 = bus
        .subscribe(Channel::Phase1Complete)
        .await
        .context("Failed to subscribe transformation stage")?;
    let phase2 = bus
        .subscribe(Channel::Phase2Complete)
        .await
        .context("Failed to subscribe loading stage")?;

    let transformation = TransformationStage::new(
        lookup,
        bus.clone(),
        TransformSettings {
            processed_dir: config.paths.processed_dir.clone(),
            dlq_dir: config.paths.dlq_dir.clone(),
        },
    );
    let loading = LoadingStage::new(sink, Uploader::new(remote, config.remote.connect_retry_policy()));
    let extraction = ExtractionStage::new(
        source,
        checkpoints,
        bus,
        ExtractionSettings {
            raw_dir: config.paths.raw_dir.clone(),
            batch_size: config.extract.batch_size,
            interval: config.extract.sleep_interval(),
            retry: config.extract.fetch_retry_policy(),
        },
    );

    let tasks = vec![
        ("loading", tokio::spawn(loading.run(phase2, shutdown.clone()))),
        ("transformation", tokio::spawn(transformation.run(phase1, shutdown.clone()))),
        ("extraction", tokio::spawn(extraction.run(shutdown.clone()))),
    ];

    info!("Pipeline started");
    Ok(PipelineHandle { shutdown, tasks })
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight work"),
        _ = terminate => info!("Received terminate signal, finishing in-flight work"),
    }
}

/// Run the whole pipeline until a shutdown signal arrives
pub async fn run(config: &Config) -> Result<()> {
    let components = Components::from_config(config).await?;
    let handle = start(config, components, CancellationToken::new()).await?;

    shutdown_signal().await;
    handle.shutdown();
    handle.wait().await;

    Ok(())
}
