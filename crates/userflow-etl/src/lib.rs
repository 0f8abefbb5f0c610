//! Userflow ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Three-stage pipeline that moves user records from a paginated HTTP source
//! into SQLite and a remote file drop.
//!
//! # Stages
//!
//! - **Extraction** ([`extract`]): checkpointed pagination into raw JSON-lines batches
//! - **Transformation** ([`transform`]): validation, enrichment, dead-letter routing
//! - **Loading** ([`load`]): run bookkeeping, table loads, remote upload
//!
//! Stages only communicate through announcements on the [`bus`].
//!
//! # Example
//!
//! ```no_run
//! use userflow_etl::{config::Config, pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     pipeline::run(&config).await
//! }
//! ```

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod extract;
pub mod fetcher;
pub mod load;
pub mod lookup;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod transform;
pub mod upload;
pub mod validate;
