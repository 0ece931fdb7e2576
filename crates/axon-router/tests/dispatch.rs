use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_mcp::McpManager;
use axon_plugin::Pipeline;
use axon_provider::{
    AdapterError, CanonicalPayload, CanonicalResponse, CapabilitySet, ChatMessage, FallbackTarget,
    KeyRecord, KeySelector, ModelDescriptor, ProviderAdapter, RequestEnvelope, RequestKind,
    RequestOverrides, Role, StreamChunk,
};
use axon_router::{DispatchBody, DispatchRequest, Router};
use axon_worker::{ProviderNetworkConfig, QueuedRequest, WorkerPoolManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct AlwaysFails5xx {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderAdapter for AlwaysFails5xx {
    fn provider_id(&self) -> &str {
        "provider-a"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::Upstream5xx { status: 503, body: "upstream unavailable".into() })
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        _sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        unimplemented!("not exercised here")
    }
}

struct Succeeds;

#[async_trait]
impl ProviderAdapter for Succeeds {
    fn provider_id(&self) -> &str {
        "provider-b"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        Ok(CanonicalResponse {
            messages: vec![ChatMessage { role: Role::Assistant, content: "fallback handled it".into(), tool_calls: vec![], tool_call_id: None }],
            usage: None,
            raw: None,
        })
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        _sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        unimplemented!("not exercised here")
    }
}

struct NeverCalled;

#[async_trait]
impl ProviderAdapter for NeverCalled {
    fn provider_id(&self) -> &str {
        "provider-a"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        panic!("the queue-full candidate must never reach the adapter")
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        _sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        panic!("the queue-full candidate must never reach the adapter")
    }
}

fn chat_envelope(provider: &str, model: &str) -> Box<RequestEnvelope> {
    Box::new(RequestEnvelope {
        request_id: axon_common::RequestId::new(),
        provider_id: provider.into(),
        model_id: model.into(),
        kind: RequestKind::Chat,
        payload: chat_payload(),
        overrides: RequestOverrides::default(),
        trace: axon_common::TraceMeta::new(),
    })
}

fn chat_payload() -> CanonicalPayload {
    CanonicalPayload::Chat {
        messages: vec![ChatMessage { role: Role::User, content: "hi".into(), tool_calls: vec![], tool_call_id: None }],
        tools: vec![],
        max_tokens: None,
        temperature: None,
        stream: false,
    }
}

/// Builds a `Router` plus the `WorkerPoolManager` backing it, so tests that
/// need to pre-fill a provider's queue (scenario 3) can enqueue directly
/// without going through `dispatch` first.
async fn router_with(
    providers: Vec<(&str, Arc<dyn ProviderAdapter>, ProviderNetworkConfig)>,
) -> (Arc<Router>, Arc<WorkerPoolManager>) {
    let key_selector = Arc::new(KeySelector::new());
    let worker_pool = Arc::new(WorkerPoolManager::new(key_selector.clone()));
    let pipeline = Arc::new(Pipeline::new());
    let mcp: Option<Arc<McpManager>> = None;

    let router = Arc::new(Router::new(worker_pool.clone(), pipeline, mcp, providers[0].0));
    for (name, adapter, config) in providers {
        key_selector
            .register(name, KeyRecord { id: format!("{name}-key"), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
            .await;
        router.register_provider(name, adapter, config).await;
    }
    (router, worker_pool)
}

/// Spec §8 scenario 1: provider A is retried in-worker until its retry
/// budget is exhausted (1 initial call + 2 retries = 3 calls), then the
/// router falls back to provider B, which succeeds on its first call.
/// Total attempts across the whole dispatch: 4.
#[tokio::test(flavor = "multi_thread")]
async fn two_provider_fallback_tallies_attempts_across_both_candidates() {
    let (router, _pool) = router_with(vec![
        (
            "provider-a",
            Arc::new(AlwaysFails5xx { calls: AtomicU32::new(0) }),
            ProviderNetworkConfig { concurrency: 1, buffer_size: 4, max_retries: 2, initial_backoff: Duration::from_millis(5), max_backoff: Duration::from_millis(20), ..Default::default() },
        ),
        (
            "provider-b",
            Arc::new(Succeeds),
            ProviderNetworkConfig { concurrency: 1, buffer_size: 4, ..Default::default() },
        ),
    ])
    .await;

    let mut request = DispatchRequest::new("any-model", RequestKind::Chat, chat_payload());
    request.overrides.fallback_chain = vec![FallbackTarget { provider_id: "provider-b".into(), model_id: "any-model".into() }];

    let outcome = router.dispatch(request).await;
    assert_eq!(outcome.attempts, 4, "3 calls to provider-a plus 1 to provider-b");
    assert_eq!(outcome.provider_id, "provider-b");
    match outcome.body {
        DispatchBody::Unary(Ok(response)) => assert_eq!(response.messages[0].content, "fallback handled it"),
        DispatchBody::Unary(Err(e)) => panic!("expected the fallback to succeed, got {e}"),
        DispatchBody::Stream { .. } => panic!("unary request should not produce a stream"),
    }
}

/// Spec §8 scenario 3: provider A's queue is already full (depth 1, no
/// worker draining it), so the router's own enqueue attempt fails
/// immediately with `queue-full` — one "attempt" with zero actual upstream
/// calls — and falls back to provider B, which succeeds. Total: 2.
#[tokio::test(flavor = "multi_thread")]
async fn queue_full_admission_failure_counts_as_one_attempt_then_falls_back() {
    let (router, pool) = router_with(vec![
        (
            "provider-a",
            Arc::new(NeverCalled),
            // Zero workers: nothing ever drains the queue.
            ProviderNetworkConfig { concurrency: 0, buffer_size: 1, ..Default::default() },
        ),
        (
            "provider-b",
            Arc::new(Succeeds),
            ProviderNetworkConfig { concurrency: 1, buffer_size: 4, ..Default::default() },
        ),
    ])
    .await;

    // Occupy provider-a's sole queue slot directly so the router's own
    // enqueue call observes it full.
    let (tx, _rx) = mpsc::channel(1);
    pool.enqueue(
        "provider-a",
        QueuedRequest {
            envelope: chat_envelope("provider-a", "any-model"),
            reply_tx: tx,
            cancel: CancellationToken::new(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(60),
        },
    )
    .await
    .expect("the first enqueue should fill the only queue slot");

    let mut request = DispatchRequest::new("any-model", RequestKind::Chat, chat_payload());
    request.overrides.fallback_chain = vec![FallbackTarget { provider_id: "provider-b".into(), model_id: "any-model".into() }];

    let outcome = router.dispatch(request).await;
    assert_eq!(outcome.attempts, 2, "1 attempt for provider-a's queue-full rejection plus 1 call to provider-b");
    assert_eq!(outcome.provider_id, "provider-b");
    match outcome.body {
        DispatchBody::Unary(Ok(response)) => assert_eq!(response.messages[0].content, "fallback handled it"),
        DispatchBody::Unary(Err(e)) => panic!("expected the fallback to succeed, got {e}"),
        DispatchBody::Stream { .. } => panic!("unary request should not produce a stream"),
    }
}
