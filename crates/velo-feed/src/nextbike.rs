//! Nextbike live-map provider.
//!
//! Fetches the `countries -> cities -> places` document over HTTP. No retries
//! here: a failed fetch is a skipped tick and the poller tries again on the
//! next interval.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::provider::{FeedError, FeedProvider, RawFeed};

#[derive(Debug, Clone)]
pub struct NextbikeFeedProvider {
    http: reqwest::Client,
    url: String,
}

impl NextbikeFeedProvider {
    /// `timeout` bounds the whole request, body included.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("nextbike http client build failed")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl FeedProvider for NextbikeFeedProvider {
    fn source_name(&self) -> &'static str {
        "nextbike"
    }

    async fn fetch(&self) -> Result<RawFeed, FeedError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Http {
                status: status.as_u16(),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        serde_json::from_slice::<RawFeed>(&body).map_err(|e| FeedError::Decode(e.to_string()))
    }
}
