//! Userflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the userflow pipeline.
//!
//! # Overview
//!
//! This crate provides functionality used by every pipeline stage:
//!
//! - **Error Handling**: Custom error type and result alias
//! - **Logging**: Centralized tracing subscriber setup
//! - **Types**: Stage announcements and the channels they travel on
//!
//! # Example
//!
//! ```no_run
//! use userflow_common::types::{Channel, Phase1Announcement};
//!
//! let announcement = Phase1Announcement::new("data/raw_users/records_20250101_000000.jsonl");
//! let payload = announcement.to_payload().unwrap();
//! assert_eq!(Channel::Phase1Complete.name(), "channel:phase1_complete");
//! # let _ = payload;
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, UserflowError};
