use axon_common::ErrorKind;
use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{CanonicalResponse, RequestEnvelope, RequestKind, StreamChunk};

/// Failure taxonomy returned by an adapter's HTTP leg. Mirrors
/// `axon_common::ErrorKind` but stays adapter-local so each variant can carry
/// the detail (status code, transport cause) that only the adapter has.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request translation failed: {0}")]
    Translation(String),

    #[error("upstream rejected credentials: {0}")]
    Auth(String),

    #[error("upstream rate limited us{}", retry_after.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimit { retry_after: Option<u64> },

    #[error("upstream returned {status}: {body}")]
    Upstream5xx { status: u16, body: String },

    #[error("upstream returned {status}: {body}")]
    Upstream4xx { status: u16, body: String },

    #[error("transport error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Translation(_) => ErrorKind::Translation,
            AdapterError::Auth(_) => ErrorKind::Auth,
            AdapterError::RateLimit { .. } => ErrorKind::RateLimit,
            AdapterError::Upstream5xx { .. } => ErrorKind::Upstream5xx,
            AdapterError::Upstream4xx { .. } => ErrorKind::Upstream4xx,
            AdapterError::Network(_) => ErrorKind::Network,
            AdapterError::Timeout => ErrorKind::Timeout,
            AdapterError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn retry_eligible(&self) -> bool {
        self.kind().retry_eligible()
    }
}

/// What a provider adapter is willing to do. The worker pool and router
/// consult this before routing a request kind or merging an MCP tool
/// catalog into the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilitySet {
    pub chat: bool,
    pub streaming: bool,
    pub tool_calls: bool,
    pub embeddings: bool,
    pub audio: bool,
}

/// A catalog entry for one model this adapter can serve.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub context_window: Option<u32>,
    pub supports_tools: bool,
}

/// The seam between the canonical request/response shape the router and
/// worker pool speak, and whatever dialect a given provider's HTTP API
/// actually uses. One adapter per provider; adapters hold no per-request
/// state.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    fn model_catalog(&self) -> &[ModelDescriptor];

    fn supports(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Chat | RequestKind::ChatStream => self.capabilities().chat,
            RequestKind::Embedding => self.capabilities().embeddings,
            RequestKind::Speech
            | RequestKind::SpeechStream
            | RequestKind::Transcription
            | RequestKind::TranscriptionStream => self.capabilities().audio,
            RequestKind::TextCompletion | RequestKind::ResponsesApi => self.capabilities().chat,
        }
    }

    /// Send the request upstream and wait for the full (non-streamed)
    /// response. Adapters that only support streaming should assemble the
    /// stream internally rather than exposing partial state here.
    async fn call(
        &self,
        envelope: &RequestEnvelope,
        api_key: &str,
    ) -> Result<CanonicalResponse, AdapterError>;

    /// Send the request upstream and produce a stream of chunks on `sink`.
    /// The adapter must push exactly one `StreamChunk::Terminal` (on success)
    /// or `StreamChunk::Error` (on failure) as the last item.
    async fn call_streaming(
        &self,
        envelope: &RequestEnvelope,
        api_key: &str,
        sink: tokio::sync::mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_retry_eligibility() {
        assert!(AdapterError::Network("boom".into()).retry_eligible());
        assert!(!AdapterError::Auth("bad key".into()).retry_eligible());
        assert!(!AdapterError::Upstream4xx { status: 400, body: String::new() }.retry_eligible());
        assert!(AdapterError::Upstream5xx { status: 503, body: String::new() }.retry_eligible());
    }

    #[test]
    fn supports_follows_capability_set() {
        struct Fixture;
        #[async_trait]
        impl ProviderAdapter for Fixture {
            fn provider_id(&self) -> &str {
                "fixture"
            }
            fn capabilities(&self) -> CapabilitySet {
                CapabilitySet { chat: true, ..Default::default() }
            }
            fn model_catalog(&self) -> &[ModelDescriptor] {
                &[]
            }
            async fn call(
                &self,
                _envelope: &RequestEnvelope,
                _api_key: &str,
            ) -> Result<CanonicalResponse, AdapterError> {
                unimplemented!()
            }
            async fn call_streaming(
                &self,
                _envelope: &RequestEnvelope,
                _api_key: &str,
                _sink: tokio::sync::mpsc::Sender<StreamChunk>,
            ) -> Result<(), AdapterError> {
                unimplemented!()
            }
        }

        let fixture = Fixture;
        assert!(fixture.supports(RequestKind::Chat));
        assert!(!fixture.supports(RequestKind::Embedding));
    }
}
