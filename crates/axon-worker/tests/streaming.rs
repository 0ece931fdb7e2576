use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_common::ErrorKind;
use axon_provider::{
    AdapterError, CanonicalPayload, CanonicalResponse, CapabilitySet, ChatMessage, KeyRecord,
    KeySelector, ModelDescriptor, ProviderAdapter, RequestEnvelope, RequestKind, RequestOverrides,
    Role, StreamChunk,
};
use axon_worker::{EnqueueError, ProviderNetworkConfig, QueuedRequest, WorkOutcome, WorkerPoolManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct FlakyAdapter {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl ProviderAdapter for FlakyAdapter {
    fn provider_id(&self) -> &str {
        "flaky"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            Err(AdapterError::Network("transient upstream blip".into()))
        } else {
            Ok(CanonicalResponse {
                messages: vec![ChatMessage { role: Role::Assistant, content: "ok".into(), tool_calls: vec![], tool_call_id: None }],
                usage: None,
                raw: None,
            })
        }
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        _sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        unimplemented!("not exercised in these tests")
    }
}

struct SlowAdapter;

#[async_trait]
impl ProviderAdapter for SlowAdapter {
    fn provider_id(&self) -> &str {
        "slow"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(CanonicalResponse::default())
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        _sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        unimplemented!("not exercised in these tests")
    }
}

fn chat_envelope(provider: &str, model: &str) -> Box<RequestEnvelope> {
    Box::new(RequestEnvelope {
        request_id: axon_common::RequestId::new(),
        provider_id: provider.into(),
        model_id: model.into(),
        kind: RequestKind::Chat,
        payload: CanonicalPayload::Chat {
            messages: vec![ChatMessage { role: Role::User, content: "hi".into(), tool_calls: vec![], tool_call_id: None }],
            tools: vec![],
            max_tokens: None,
            temperature: None,
            stream: false,
        },
        overrides: RequestOverrides::default(),
        trace: axon_common::TraceMeta::new(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_eligible_failures_eventually_succeed() {
    let key_selector = Arc::new(KeySelector::new());
    key_selector
        .register("flaky", KeyRecord { id: "k1".into(), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
        .await;

    let manager = WorkerPoolManager::new(key_selector);
    let adapter = Arc::new(FlakyAdapter { remaining_failures: AtomicU32::new(2) });
    manager
        .register_provider(
            "flaky",
            adapter,
            ProviderNetworkConfig {
                concurrency: 1,
                buffer_size: 4,
                max_retries: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .await;

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    manager
        .enqueue(
            "flaky",
            QueuedRequest {
                envelope: chat_envelope("flaky", "any-model"),
                reply_tx,
                cancel: CancellationToken::new(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

    match reply_rx.recv().await.expect("worker should reply") {
        WorkOutcome::Unary(Ok(success)) => {
            assert_eq!(success.response.messages[0].content, "ok");
            assert_eq!(success.attempts, 3, "two failures plus the succeeding call");
        }
        WorkOutcome::Unary(Err(e)) => panic!("expected eventual success, got {e}"),
        WorkOutcome::Stream { .. } => panic!("unary request should not produce a stream"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_short_circuits_without_retrying() {
    let key_selector = Arc::new(KeySelector::new());
    key_selector
        .register("slow", KeyRecord { id: "k1".into(), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
        .await;

    let manager = WorkerPoolManager::new(key_selector);
    manager
        .register_provider("slow", Arc::new(SlowAdapter), ProviderNetworkConfig { concurrency: 1, buffer_size: 4, ..Default::default() })
        .await;

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    manager
        .enqueue(
            "slow",
            QueuedRequest {
                envelope: chat_envelope("slow", "any-model"),
                reply_tx,
                cancel: cancel.clone(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), reply_rx.recv())
        .await
        .expect("worker should observe cancellation promptly")
        .expect("channel should not close without a reply");

    match outcome {
        WorkOutcome::Unary(Err(e)) => assert_eq!(e.kind, ErrorKind::Cancelled),
        other => panic!("expected a cancelled failure envelope, got a different outcome: {}", matches!(other, WorkOutcome::Stream { .. })),
    }
}

struct ChunkyAdapter {
    chunk_count: u32,
    delay_per_chunk: Duration,
}

#[async_trait]
impl ProviderAdapter for ChunkyAdapter {
    fn provider_id(&self) -> &str {
        "chunky"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, streaming: true, ..Default::default() }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &[]
    }

    async fn call(&self, _envelope: &RequestEnvelope, _api_key: &str) -> Result<CanonicalResponse, AdapterError> {
        unimplemented!("not exercised in these tests")
    }

    async fn call_streaming(
        &self,
        _envelope: &RequestEnvelope,
        _api_key: &str,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        let mut assembled = String::new();
        for i in 0..self.chunk_count {
            tokio::time::sleep(self.delay_per_chunk).await;
            let piece = format!("chunk{i} ");
            assembled.push_str(&piece);
            if sink.send(StreamChunk::Delta { content: piece, tool_call_deltas: vec![] }).await.is_err() {
                return Ok(());
            }
        }
        let response = CanonicalResponse {
            messages: vec![ChatMessage { role: Role::Assistant, content: assembled, tool_calls: vec![], tool_call_id: None }],
            usage: None,
            raw: None,
        };
        let _ = sink.send(StreamChunk::Terminal { assembled: response }).await;
        Ok(())
    }
}

fn stream_envelope(provider: &str, model: &str) -> Box<RequestEnvelope> {
    let mut envelope = chat_envelope(provider, model);
    envelope.kind = RequestKind::ChatStream;
    if let CanonicalPayload::Chat { stream, .. } = &mut envelope.payload {
        *stream = true;
    }
    envelope
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_reply_arrives_before_the_upstream_call_finishes() {
    let key_selector = Arc::new(KeySelector::new());
    key_selector
        .register("chunky", KeyRecord { id: "k1".into(), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
        .await;

    let manager = WorkerPoolManager::new(key_selector);
    // More chunks than the bounded channel's capacity (32): if the worker
    // waited for `call_streaming` to finish before sending the `Stream`
    // header, nothing would be draining the channel yet and this would
    // deadlock well before the 40th chunk.
    let adapter = Arc::new(ChunkyAdapter { chunk_count: 40, delay_per_chunk: Duration::from_millis(5) });
    manager
        .register_provider("chunky", adapter, ProviderNetworkConfig { concurrency: 1, buffer_size: 4, ..Default::default() })
        .await;

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    manager
        .enqueue(
            "chunky",
            QueuedRequest {
                envelope: stream_envelope("chunky", "any-model"),
                reply_tx,
                cancel: CancellationToken::new(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

    let header = tokio::time::timeout(Duration::from_millis(100), reply_rx.recv())
        .await
        .expect("the stream header must arrive immediately, not after the whole call resolves")
        .expect("worker should reply");

    let mut chunks = match header {
        WorkOutcome::Stream { chunks, attempts } => {
            assert_eq!(attempts, 1);
            chunks
        }
        WorkOutcome::Unary(_) => panic!("streaming request should not produce a unary outcome"),
    };

    let mut deltas = 0u32;
    let mut saw_terminal = false;
    while let Some(chunk) = chunks.recv().await {
        match chunk {
            StreamChunk::Delta { .. } => deltas += 1,
            StreamChunk::Terminal { .. } => {
                saw_terminal = true;
                break;
            }
            StreamChunk::Error { error } => panic!("unexpected stream error: {error}"),
        }
    }
    assert_eq!(deltas, 40);
    assert!(saw_terminal);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_mid_stream_stops_further_chunks() {
    let key_selector = Arc::new(KeySelector::new());
    key_selector
        .register("chunky", KeyRecord { id: "k1".into(), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
        .await;

    let manager = WorkerPoolManager::new(key_selector);
    let adapter = Arc::new(ChunkyAdapter { chunk_count: 1000, delay_per_chunk: Duration::from_millis(5) });
    manager
        .register_provider("chunky", adapter, ProviderNetworkConfig { concurrency: 1, buffer_size: 4, ..Default::default() })
        .await;

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    manager
        .enqueue(
            "chunky",
            QueuedRequest {
                envelope: stream_envelope("chunky", "any-model"),
                reply_tx,
                cancel: cancel.clone(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

    let mut chunks = match reply_rx.recv().await.expect("worker should reply with a stream header") {
        WorkOutcome::Stream { chunks, .. } => chunks,
        WorkOutcome::Unary(_) => panic!("streaming request should not produce a unary outcome"),
    };

    // Drain exactly 3 chunks, matching the cancel-mid-stream scenario, then
    // cancel and confirm the producer stops rather than running to completion.
    for _ in 0..3 {
        match chunks.recv().await.expect("producer should still be sending before cancellation") {
            StreamChunk::Delta { .. } => {}
            other => panic!("expected deltas before cancelling, got a different chunk: {}", matches!(other, StreamChunk::Terminal { .. })),
        }
    }
    cancel.cancel();

    // The channel should close (all senders dropped once the spawned task
    // observes cancellation) well before the adapter would have produced all
    // 1000 chunks.
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        let mut count = 0u32;
        while chunks.recv().await.is_some() {
            count += 1;
        }
        count
    })
    .await
    .expect("stream should terminate promptly after cancellation instead of running to completion");
    assert!(drained < 1000, "cancellation should cut the stream short, got {drained} more chunks");
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_full_is_reported_immediately_without_blocking() {
    let key_selector = Arc::new(KeySelector::new());
    key_selector
        .register("slow", KeyRecord { id: "k1".into(), secret: "sk-test".into(), allowed_models: vec![], weight: 1.0 })
        .await;

    let manager = WorkerPoolManager::new(key_selector);
    // Zero workers: nothing ever drains the queue, so the second enqueue
    // must see it full rather than hang.
    manager
        .register_provider("slow", Arc::new(SlowAdapter), ProviderNetworkConfig { concurrency: 1, buffer_size: 1, ..Default::default() })
        .await;

    let (tx1, _rx1) = mpsc::channel(1);
    manager
        .enqueue(
            "slow",
            QueuedRequest {
                envelope: chat_envelope("slow", "m"),
                reply_tx: tx1,
                cancel: CancellationToken::new(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            },
        )
        .await
        .unwrap();
    // Give the sole worker time to dequeue the first item and start its
    // (30s) call, so the queue slot below is the only one available.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (tx2, _rx2) = mpsc::channel(1);
    manager
        .enqueue(
            "slow",
            QueuedRequest {
                envelope: chat_envelope("slow", "m"),
                reply_tx: tx2,
                cancel: CancellationToken::new(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

    let (tx3, _rx3) = mpsc::channel(1);
    let result = manager
        .enqueue(
            "slow",
            QueuedRequest {
                envelope: chat_envelope("slow", "m"),
                reply_tx: tx3,
                cancel: CancellationToken::new(),
                deadline: tokio::time::Instant::now() + Duration::from_secs(60),
            },
        )
        .await;

    assert!(matches!(result, Err(EnqueueError::QueueFull)));
}
