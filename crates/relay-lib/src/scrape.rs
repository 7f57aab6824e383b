//! HTTP scrape client
//!
//! Every scrape runs on a fresh connection: idle pooling is disabled and
//! requests ask the target to close the connection once the body has
//! been read.

use crate::models::ScrapeTarget;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONNECTION, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Accept header sent with every scrape; only the text format is decoded
const ACCEPT_EXPOSITION: &str = "text/plain;version=0.0.4;q=1,*/*;q=0.1";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read response body from {url}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Raw payload of a successful scrape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Trait for scrape implementations
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Fetch the exposition payload of a target
    async fn scrape(&self, target: &ScrapeTarget) -> Result<ScrapeResponse, ScrapeError>;
}

/// Scraper issuing plain HTTP GET requests
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    /// Create a scraper; `timeout` of `None` leaves requests without a deadline
    pub fn new(timeout: Option<Duration>) -> Result<Self, ScrapeError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(0)
            .user_agent(concat!("metrics-relay/", env!("CARGO_PKG_VERSION")));

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder.build().map_err(ScrapeError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, target: &ScrapeTarget) -> Result<ScrapeResponse, ScrapeError> {
        let url = target.url.as_str();

        let response = self
            .client
            .get(url)
            .header(ACCEPT, ACCEPT_EXPOSITION)
            .header(CONNECTION, "close")
            .send()
            .await
            .map_err(|source| ScrapeError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|source| ScrapeError::Body {
                url: url.to_string(),
                source,
            })?;

        debug!(url = %url, bytes = body.len(), content_type = ?content_type, "Scraped target");

        Ok(ScrapeResponse {
            body: body.to_vec(),
            content_type,
        })
    }
}
