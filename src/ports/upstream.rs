//! Port for the upstream daemon the engine forwards to.
use async_trait::async_trait;
use bytes::Bytes;

use crate::core::error::UpstreamError;

/// Outbound side of the Forward status: one round-trip to the upstream
/// daemon. The looper is the only caller; tests substitute a simulated
/// upstream.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// POST `body` to `target` and return the raw response body.
    async fn send(&self, target: &str, body: String) -> Result<Bytes, UpstreamError>;
}
