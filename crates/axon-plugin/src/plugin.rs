use async_trait::async_trait;
use axon_common::GatewayError;
use axon_provider::{CanonicalResponse, RequestEnvelope};

/// What a pre-hook decided for this request. `ShortCircuitError`'s
/// `allow_fallbacks` mirrors the request-level override: `None` is treated
/// as "fallbacks allowed" by the router, same as
/// `RequestOverrides::allow_fallbacks_resolved`.
pub enum PreHookOutcome {
    Continue(Box<RequestEnvelope>),
    ShortCircuitResponse(CanonicalResponse),
    ShortCircuitError { error: GatewayError, allow_fallbacks: Option<bool> },
}

/// A single pipeline stage. Pre/post hooks run in opposite order across the
/// whole pipeline (spec §4.5) so every executed pre-hook sees its matching
/// post-hook exactly once.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_hook(&self, envelope: Box<RequestEnvelope>) -> PreHookOutcome;

    /// May turn a success into a failure (or the reverse) — recovery and
    /// injected-failure plugins both live here.
    async fn post_hook(
        &self,
        envelope: &RequestEnvelope,
        outcome: Result<CanonicalResponse, GatewayError>,
    ) -> Result<CanonicalResponse, GatewayError>;

    async fn shutdown(&self) {}
}
