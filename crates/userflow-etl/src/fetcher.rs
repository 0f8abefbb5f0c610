//! Paginated HTTP source
//!
//! The upstream collection answers `GET <base>?limit=N&skip=M` with
//! `{"users": [...], "total": n}`. Records are kept as opaque JSON; their
//! shape is the validator's concern, not the fetcher's.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// One page of the source collection
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub users: Vec<Value>,
    #[serde(default)]
    pub total: u64,
}

/// Why a page could not be fetched
///
/// Every variant is transient from the pipeline's point of view: the
/// extraction stage retries them all with backoff.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source returned HTTP {status} for skip={skip}")]
    Status { status: u16, skip: u64 },

    #[error("request for skip={skip} failed: {source}")]
    Transport {
        skip: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not decode page at skip={skip}: {message}")]
    Decode { skip: u64, message: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Anything that can hand out pages of records by offset
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, skip: u64, limit: u64) -> Result<Page, FetchError>;
}

/// Page source backed by the upstream HTTP API
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("userflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, skip: u64, limit: u64) -> Result<Page, FetchError> {
        debug!(url = %self.base_url, limit, skip, "Requesting page");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("limit", limit), ("skip", skip)])
            .send()
            .await
            .map_err(|source| FetchError::Transport { skip, source })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                status: status.as_u16(),
                skip,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport { skip, source })?;

        serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            skip,
            message: e.to_string(),
        })
    }
}
