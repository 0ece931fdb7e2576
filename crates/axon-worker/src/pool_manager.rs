use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axon_common::{ErrorKind, GatewayError};
use axon_provider::{KeySelector, ProviderAdapter, RequestKind, StreamChunk, UnavailableReason};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};

use crate::config::ProviderNetworkConfig;
use crate::work::{EnqueueError, QueuedRequest, WorkOutcome};

struct ProviderPool {
    sender: Mutex<Option<mpsc::Sender<QueuedRequest>>>,
    draining: AtomicBool,
}

/// Bounded per-provider queues plus fixed worker pools, isolated from one
/// another: a saturated or failing provider never starves another's workers
/// (spec §4.4).
pub struct WorkerPoolManager {
    pools: tokio::sync::RwLock<HashMap<String, Arc<ProviderPool>>>,
    adapters: tokio::sync::RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    key_selector: Arc<KeySelector>,
}

impl WorkerPoolManager {
    pub fn new(key_selector: Arc<KeySelector>) -> Self {
        Self {
            pools: tokio::sync::RwLock::new(HashMap::new()),
            adapters: tokio::sync::RwLock::new(HashMap::new()),
            key_selector,
        }
    }

    pub async fn register_provider(
        &self,
        provider_id: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        config: ProviderNetworkConfig,
    ) {
        let provider_id = provider_id.into();
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));

        let pool = Arc::new(ProviderPool { sender: Mutex::new(Some(tx)), draining: AtomicBool::new(false) });

        self.adapters.write().await.insert(provider_id.clone(), adapter.clone());
        self.pools.write().await.insert(provider_id.clone(), pool);

        for worker_idx in 0..config.concurrency.max(1) {
            let shared_rx = shared_rx.clone();
            let adapter = adapter.clone();
            let key_selector = self.key_selector.clone();
            let config = config.clone();
            let provider_id = provider_id.clone();
            tokio::spawn(async move {
                worker_loop(worker_idx, provider_id, shared_rx, adapter, key_selector, config).await;
            });
        }
    }

    /// Never blocks: returns immediately with `QueueFull`/`Draining`/
    /// `UnknownProvider` instead of waiting for queue space.
    pub async fn enqueue(&self, provider_id: &str, request: QueuedRequest) -> Result<(), EnqueueError> {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(provider_id).cloned()
        };
        let Some(pool) = pool else {
            return Err(EnqueueError::UnknownProvider);
        };
        if pool.draining.load(Ordering::Acquire) {
            return Err(EnqueueError::Draining);
        }
        let guard = pool.sender.lock().await;
        match guard.as_ref() {
            None => Err(EnqueueError::Draining),
            Some(sender) => sender.try_send(request).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Draining,
            }),
        }
    }

    /// Marks the provider's queue as draining and closes the send side.
    /// Workers already holding in-flight items finish them; once the queue
    /// empties, each worker's `recv()` observes the close and exits.
    pub async fn shutdown_provider(&self, provider_id: &str) {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(provider_id).cloned()
        };
        if let Some(pool) = pool {
            pool.draining.store(true, Ordering::Release);
            pool.sender.lock().await.take();
        }
    }
}

async fn worker_loop(
    worker_idx: usize,
    provider_id: String,
    shared_rx: Arc<Mutex<mpsc::Receiver<QueuedRequest>>>,
    adapter: Arc<dyn ProviderAdapter>,
    key_selector: Arc<KeySelector>,
    config: ProviderNetworkConfig,
) {
    // ThreadRng isn't Send, so it can't be held across the awaits below;
    // seed a Send-able StdRng from it once up front instead.
    let seed = rand::rng().random::<u64>();
    let mut rng = StdRng::seed_from_u64(seed);
    loop {
        let next = {
            let mut rx = shared_rx.lock().await;
            rx.recv().await
        };
        let Some(request) = next else {
            tracing::info!(event = "worker_stopped", provider = %provider_id, worker_idx, "queue closed, worker exiting");
            break;
        };
        process_request(&provider_id, &adapter, &key_selector, &config, &mut rng, request).await;
    }
}

/// Cools a key out of rotation on a retryable or terminal upstream failure
/// whose cause is specific to this credential — without this, a
/// rate-limited or auth-rejected key gets reselected on every retry and
/// every subsequent request (spec §4.3).
async fn cool_down_key(key_selector: &KeySelector, key_id: &str, model_id: &str, err: &axon_provider::AdapterError) {
    use axon_provider::AdapterError;
    let (duration, reason) = match err {
        AdapterError::Auth(_) => (Duration::from_secs(300), UnavailableReason::AuthRejected),
        AdapterError::RateLimit { retry_after } => (Duration::from_secs(retry_after.unwrap_or(30)), UnavailableReason::RateLimited),
        AdapterError::Upstream5xx { .. } => (Duration::from_secs(10), UnavailableReason::UpstreamError),
        _ => return,
    };
    key_selector.mark_model_unavailable(key_id, model_id, duration, reason).await;
    if matches!(reason, UnavailableReason::AuthRejected) {
        // A rejected credential is rejected for every model it serves, not
        // just the one in flight.
        key_selector.mark_unavailable(key_id, duration, reason).await;
    }
}

async fn process_request(
    provider_id: &str,
    adapter: &Arc<dyn ProviderAdapter>,
    key_selector: &Arc<KeySelector>,
    config: &ProviderNetworkConfig,
    rng: &mut StdRng,
    request: QueuedRequest,
) {
    let QueuedRequest { envelope, reply_tx, cancel, deadline } = request;
    let streaming = matches!(envelope.kind, RequestKind::ChatStream);

    // `attempt` counts upstream calls already *completed and failed*. It is
    // reported as-is (not +1) when a request never reaches an upstream call
    // this iteration (cancelled, deadline, no key) and as `attempt + 1` when
    // an upstream call actually ran (success or failure) — see
    // `to_gateway_error`/`WorkSuccess`.
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            let _ = reply_tx
                .send(WorkOutcome::Unary(Err(cancelled_error(provider_id, &envelope.model_id, attempt))))
                .await;
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = reply_tx
                .send(WorkOutcome::Unary(Err(GatewayError::new(ErrorKind::Timeout, "request deadline exceeded")
                    .with_provider(provider_id)
                    .with_model(envelope.model_id.as_str())
                    .with_attempts(attempt))))
                .await;
            return;
        }

        let key = match key_selector.select(provider_id, &envelope.model_id, rng).await {
            Ok(key) => key,
            Err(_) => {
                let _ = reply_tx
                    .send(WorkOutcome::Unary(Err(GatewayError::new(ErrorKind::NoKeyForModel, "no eligible key for model")
                        .with_provider(provider_id)
                        .with_model(envelope.model_id.as_str())
                        .with_attempts(attempt))))
                    .await;
                return;
            }
        };

        tracing::info!(
            event = "worker_attempt",
            provider = %provider_id,
            model = %envelope.model_id,
            attempt_no = attempt,
            request_id = %envelope.request_id,
            "dispatching upstream call"
        );

        if streaming {
            // A streaming reply hands back the header (the `chunks` receiver)
            // the moment the call is handed off, not after it resolves —
            // otherwise the caller can't start consuming until the whole
            // upstream response has already buffered into a channel no one
            // was draining. The upstream call itself runs in a detached task;
            // once the header is sent, retrying a failed connection is no
            // longer possible (the caller already owns the receiver), so any
            // failure — pre-stream or mid-stream — is reported as a
            // `StreamChunk::Error` on the channel instead of a worker retry.
            let (chunk_tx, chunk_rx) = mpsc::channel(32);
            let attempts = attempt + 1;
            if reply_tx.send(WorkOutcome::Stream { chunks: chunk_rx, attempts }).await.is_err() {
                return;
            }

            let adapter = adapter.clone();
            let key_id = key.id.clone();
            let api_key = key.secret.clone();
            let key_selector = key_selector.clone();
            let provider_id = provider_id.to_string();
            let model_id = envelope.model_id.clone();
            let cancel = cancel.clone();
            let error_tx = chunk_tx.clone();
            tokio::spawn(async move {
                let call = adapter.call_streaming(&envelope, &api_key, chunk_tx);
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(axon_provider::AdapterError::Cancelled),
                    result = call => result,
                };
                if let Err(err) = outcome {
                    cool_down_key(&key_selector, &key_id, &model_id, &err).await;
                    let error = to_gateway_error(&provider_id, &model_id, attempts, err);
                    let _ = error_tx.send(StreamChunk::Error { error }).await;
                }
            });
            return;
        } else {
            let call = adapter.call(&envelope, &key.secret);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(axon_provider::AdapterError::Cancelled),
                result = call => result,
            };
            match outcome {
                Ok(response) => {
                    let _ = reply_tx
                        .send(WorkOutcome::Unary(Ok(WorkSuccess { response, attempts: attempt + 1 })))
                        .await;
                    return;
                }
                Err(err) if err.retry_eligible() && attempt < config.max_retries => {
                    cool_down_key(key_selector, &key.id, &envelope.model_id, &err).await;
                    attempt += 1;
                    backoff_sleep(config, attempt).await;
                    continue;
                }
                Err(err) => {
                    cool_down_key(key_selector, &key.id, &envelope.model_id, &err).await;
                    let _ = reply_tx
                        .send(WorkOutcome::Unary(Err(to_gateway_error(provider_id, &envelope.model_id, attempt + 1, err))))
                        .await;
                    return;
                }
            }
        }
    }
}

async fn backoff_sleep(config: &ProviderNetworkConfig, attempt: u32) {
    let exp = config.initial_backoff.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(config.max_backoff);
    tokio::time::sleep(capped).await;
}

fn cancelled_error(provider_id: &str, model_id: &str, attempt: u32) -> GatewayError {
    GatewayError::new(ErrorKind::Cancelled, "request cancelled")
        .with_provider(provider_id)
        .with_model(model_id)
        .with_attempts(attempt)
        .allow_fallbacks(false)
}

fn to_gateway_error(
    provider_id: &str,
    model_id: &str,
    attempt: u32,
    err: axon_provider::AdapterError,
) -> GatewayError {
    GatewayError::new(err.kind(), err.to_string())
        .with_provider(provider_id)
        .with_model(model_id)
        .with_attempts(attempt)
}
