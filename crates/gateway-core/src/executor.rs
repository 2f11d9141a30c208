//! Per-provider execution seam.
//!
//! An executor performs the actual upstream I/O for one provider id. It
//! receives a payload already translated into its wire format and returns raw
//! bytes, or a stream of raw byte chunks when streaming.

use crate::credential::Credential;
use crate::error::GatewayResult;
use crate::format::ApiFormat;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Stream of raw upstream chunks
pub type ChunkStream = BoxStream<'static, GatewayResult<Bytes>>;

/// One upstream call
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    /// Concrete upstream model
    pub model: String,
    /// Payload in the executor's wire format
    pub payload: Bytes,
    /// Credential selected for this attempt
    pub credential: Credential,
    /// Whether a streamed response is wanted
    pub stream: bool,
    /// Cancelled when the caller goes away
    pub cancel: CancellationToken,
    /// Correlation id
    pub request_id: String,
}

/// Executes translated requests against one upstream provider
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Provider id (e.g. "openai", "anthropic", "gemini")
    fn identifier(&self) -> &str;

    /// Wire format the upstream speaks
    fn format(&self) -> ApiFormat;

    /// Models this provider serves
    fn models(&self) -> Vec<String> {
        Vec::new()
    }

    /// Perform a non-streaming call
    ///
    /// # Errors
    /// `GatewayError::Status` on upstream failure, `Network` on transport failure
    async fn execute(&self, request: ExecutorRequest) -> GatewayResult<Bytes>;

    /// Perform a streaming call
    ///
    /// # Errors
    /// `GatewayError::Status` when the upstream rejects the request before streaming
    async fn execute_stream(&self, request: ExecutorRequest) -> GatewayResult<ChunkStream>;
}
