use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::FetchCfg;

/// Outcome of a failed fetch. Clonable so the cache can hand the same
/// failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read body from {url}: {reason}")]
    Body { url: String, reason: String },
}

/// Retrieves raw bytes (usually a DER certificate) for an issuer URL.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// `Fetch` over a shared `reqwest::Client`. Timeouts are enforced here and
/// nowhere else in the crate.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchCfg) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_ref())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        tracing::debug!(url, "fetching issuer certificate");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(|err| FetchError::Body {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}
