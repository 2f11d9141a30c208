//! Dispatch inputs and outputs.

use bytes::Bytes;
use gateway_core::ApiFormat;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// One inbound request handed to the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Correlation id
    pub request_id: String,
    /// Wire format the caller speaks
    pub format: ApiFormat,
    /// Requested model (concrete, virtual or `provider/model`)
    pub model: String,
    /// Caller payload in `format`
    pub payload: Bytes,
    /// Whether a streamed answer is wanted
    pub stream: bool,
    /// Explicit provider ids to use, in order
    pub providers: Vec<String>,
    /// Fires when the caller goes away
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    /// Create a non-streaming request with a generated id
    pub fn new(format: ApiFormat, model: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            format,
            model: model.into(),
            payload: payload.into(),
            stream: false,
            providers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the request id
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Set the streaming flag
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Restrict dispatch to these providers
    #[must_use]
    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.providers = providers;
        self
    }

    /// Use the caller's cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A completed non-streaming dispatch
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    /// Body in the caller's format
    pub body: Bytes,
    /// Caller format
    pub format: ApiFormat,
    /// Provider that answered
    pub provider: String,
    /// Concrete model that answered
    pub model: String,
    /// Virtual model the request named, if any
    pub virtual_model: Option<String>,
}

/// One entry of the model listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableModel {
    /// Model id as callers should send it
    pub id: String,
    /// Provider serving it, `None` for virtual models
    pub provider: Option<String>,
    /// Whether this is a virtual model
    pub is_virtual: bool,
}
