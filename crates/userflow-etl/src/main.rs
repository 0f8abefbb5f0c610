//! Userflow - user record ETL pipeline

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use userflow_common::logging::{init_logging, LogConfig, LogLevel};
use userflow_common::types::Phase2Announcement;
use userflow_etl::bus::BroadcastBus;
use userflow_etl::checkpoint::{CheckpointStore, FileCheckpointStore};
use userflow_etl::config::Config;
use userflow_etl::extract::{ExtractionSettings, ExtractionStage};
use userflow_etl::fetcher::HttpPageSource;
use userflow_etl::load::{LoadingStage, TableLoad};
use userflow_etl::lookup::DepartmentLookup;
use userflow_etl::pipeline;
use userflow_etl::sink::RelationalSink;
use userflow_etl::transform::{TransformSettings, TransformationStage};
use userflow_etl::upload::{FtpRemoteStore, UploadReport, Uploader};

#[derive(Parser, Debug)]
#[command(name = "userflow")]
#[command(author, version, about = "User record ETL pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all three stages until interrupted
    Run,

    /// Run a single extraction cycle and exit
    ExtractOnce,

    /// Transform one raw batch file without publishing
    Transform {
        /// Raw JSON-lines file
        raw_file: PathBuf,
    },

    /// Load and upload a set of artifacts
    Load {
        #[arg(long)]
        raw: Option<PathBuf>,

        #[arg(long)]
        processed: Option<PathBuf>,

        #[arg(long)]
        dlq: Option<PathBuf>,

        /// Valid record count to record for the run
        #[arg(long, default_value_t = 0)]
        valid: u64,

        /// Invalid record count to record for the run
        #[arg(long, default_value_t = 0)]
        invalid: u64,
    },

    /// List recorded runs
    Runs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&log_config(cli.verbose)?)?;

    let config = Config::load()?;

    match cli.command {
        Command::Run => {
            info!("Starting pipeline");
            pipeline::run(&config).await?;
        },
        Command::ExtractOnce => extract_once(&config).await?,
        Command::Transform { raw_file } => transform(&config, raw_file).await?,
        Command::Load {
            raw,
            processed,
            dlq,
            valid,
            invalid,
        } => {
            let announcement = Phase2Announcement {
                raw_file: raw,
                processed_file: processed,
                dlq_file: dlq,
                valid_count: valid,
                invalid_count: invalid,
            };
            load(&config, &announcement).await?;
        },
        Command::Runs => runs(&config).await?,
    }

    Ok(())
}

/// Log settings from the CLI flags, overridden by `LOG_*` variables
///
/// `.env` is loaded first so its `LOG_*` entries count as environment.
fn log_config(verbose: bool) -> Result<LogConfig> {
    dotenvy::dotenv().ok();

    let log_level = if verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    LogConfig::builder()
        .level(log_level)
        .log_file_prefix("userflow")
        .build()
        .merge_env()
}

async fn extract_once(config: &Config) -> Result<()> {
    let store = Arc::new(FileCheckpointStore::new(&config.extract.state_file));
    let stage = ExtractionStage::new(
        Arc::new(HttpPageSource::new(&config.extract.api_base_url, config.extract.http_timeout())?),
        store.clone(),
        Arc::new(BroadcastBus::new()),
        ExtractionSettings {
            raw_dir: config.paths.raw_dir.clone(),
            batch_size: config.extract.batch_size,
            interval: config.extract.sleep_interval(),
            retry: config.extract.fetch_retry_policy(),
        },
    );

    let report = stage.run_cycle(store.load().await).await?;

    println!("Outcome:         {:?}", report.outcome);
    println!("Records written: {}", report.records_written);
    match report.raw_file {
        Some(path) => println!("Raw file:        {}", path.display()),
        None => println!("Raw file:        (none)"),
    }
    println!("Next cursor:     {}", report.next.cursor);
    Ok(())
}

async fn transform(config: &Config, raw_file: PathBuf) -> Result<()> {
    let lookup = DepartmentLookup::from_csv_path(&config.paths.lookup_file)?;
    let stage = TransformationStage::new(
        Arc::new(lookup),
        Arc::new(BroadcastBus::new()),
        TransformSettings {
            processed_dir: config.paths.processed_dir.clone(),
            dlq_dir: config.paths.dlq_dir.clone(),
        },
    );

    let result = stage.process_file(&raw_file).await?;

    println!("Valid:     {}", result.valid_count);
    println!("Invalid:   {}", result.invalid_count);
    if let Some(path) = &result.processed_file {
        println!("Processed: {}", path.display());
    }
    if let Some(path) = &result.dlq_file {
        println!("DLQ:       {}", path.display());
    }
    Ok(())
}

async fn load(config: &Config, announcement: &Phase2Announcement) -> Result<()> {
    let sink = RelationalSink::connect(&config.database.url).await?;
    let uploader = Uploader::new(
        Arc::new(FtpRemoteStore::new(config.remote.clone())),
        config.remote.connect_retry_policy(),
    );
    let stage = LoadingStage::new(sink, uploader);

    let report = stage.handle(announcement).await?;

    println!("Run id: {}", report.run_id);
    for table in &report.tables {
        let status = match &table.status {
            TableLoad::Skipped => "skipped".to_string(),
            TableLoad::Loaded(rows) => format!("{} rows", rows),
            TableLoad::Failed(reason) => format!("failed: {}", reason),
        };
        println!("  {:<16} {}", table.kind.table(), status);
    }
    match &report.upload {
        UploadReport::ConnectFailed { attempts } => {
            println!("Upload: not connected after {} attempts", attempts)
        },
        UploadReport::Finished(summary) => println!(
            "Upload: {} uploaded, {} missing, {} failed",
            summary.uploaded.len(),
            summary.missing.len(),
            summary.failed.len()
        ),
    }
    Ok(())
}

async fn runs(config: &Config) -> Result<()> {
    let sink = RelationalSink::connect(&config.database.url).await?;
    let runs = sink.list_runs().await?;

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }

    println!("{:<6} {:<35} {:>7} {:>8}  processed file", "id", "timestamp", "valid", "invalid");
    for run in runs {
        println!(
            "{:<6} {:<35} {:>7} {:>8}  {}",
            run.id,
            run.timestamp,
            run.valid_count,
            run.invalid_count,
            run.processed_file.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_log_level_from_dotenv_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "LOG_LEVEL=warn\n").unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let config = log_config(true);
        std::env::set_current_dir(original).unwrap();
        std::env::remove_var("LOG_LEVEL");

        assert_eq!(config.unwrap().level, LogLevel::Warn);
    }
}
