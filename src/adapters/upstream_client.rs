//! Reqwest-based upstream client.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use reqwest::header;

use crate::{core::error::UpstreamError, ports::upstream::UpstreamClient};

/// HTTP client for the upstream daemon's JSON-RPC endpoint. One instance is
/// shared by every Forward and blocking upstream call; reqwest pools the
/// underlying connections.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl HttpUpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build upstream client: {e}"))?;
        Ok(Self {
            client,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(&self, target: &str, body: String) -> Result<Bytes, UpstreamError> {
        let response = self
            .client
            .post(target)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.timeout_ms)
                } else {
                    UpstreamError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::BadStatus(status.as_u16()));
        }

        response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Connection(e.to_string()))
    }
}
