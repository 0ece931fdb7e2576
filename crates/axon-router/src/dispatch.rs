use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axon_common::{ErrorKind, GatewayError, RequestId, TraceMeta};
use axon_mcp::McpManager;
use axon_plugin::{Pipeline, PreHookRun};
use axon_pool::{Pool, ReplyChannel};
use axon_provider::{
    CanonicalPayload, CanonicalResponse, ChatMessage, FallbackTarget, RequestEnvelope, RequestKind,
    RequestOverrides, Role, StreamChunk, ToolDefinition,
};
use axon_worker::{EnqueueError, ProviderNetworkConfig, QueuedRequest, WorkOutcome, WorkerPoolManager};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::route::resolve_route;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_ENVELOPE_POOL_CAP: usize = 256;
const DEFAULT_REPLY_POOL_CAP: usize = 256;
/// Caps the tool-call -> execute -> continuation cycle (spec §4.6's
/// "tool-call record" lifecycle) so a model that keeps calling tools forever
/// can't pin a worker indefinitely.
const MAX_AUTO_EXECUTE_ROUNDS: usize = 8;

/// What the caller (a transport handler) hands to [`Router::dispatch`].
pub struct DispatchRequest {
    pub model: String,
    pub kind: RequestKind,
    pub payload: CanonicalPayload,
    pub overrides: RequestOverrides,
    pub mcp_enabled: bool,
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn new(model: impl Into<String>, kind: RequestKind, payload: CanonicalPayload) -> Self {
        Self {
            model: model.into(),
            kind,
            payload,
            overrides: RequestOverrides::default(),
            mcp_enabled: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// The body of a terminal dispatch outcome. A streaming dispatch returns
/// immediately after the worker accepts the upstream call (spec §4.7 step
/// 6); chunk consumption happens on whoever holds `chunks`.
pub enum DispatchBody {
    Unary(Result<CanonicalResponse, GatewayError>),
    Stream { chunks: mpsc::Receiver<StreamChunk> },
}

/// `attempts` counts every upstream call attempted across every fallback
/// candidate (spec §8 scenario 1: two fallback candidates, one retried
/// twice in-worker, totals 4 — not 2 "router hops").
pub struct DispatchOutcome {
    pub body: DispatchBody,
    pub attempts: u32,
    pub provider_id: String,
    pub model_id: String,
    pub request_id: RequestId,
}

struct ProviderDefaults {
    request_timeout: Duration,
}

/// Top-level entry point (spec §4.7): resolves provider + model, merges the
/// MCP tool catalog, runs the plugin pipeline around a worker-pool enqueue,
/// and drives the fallback chain on failure.
pub struct Router {
    worker_pool: Arc<WorkerPoolManager>,
    pipeline: Arc<Pipeline>,
    mcp: Option<Arc<McpManager>>,
    envelope_pool: Pool<RequestEnvelope>,
    reply_pool: Pool<ReplyChannel<WorkOutcome>>,
    provider_defaults: RwLock<HashMap<String, ProviderDefaults>>,
    default_provider: RwLock<String>,
}

impl Router {
    pub fn new(worker_pool: Arc<WorkerPoolManager>, pipeline: Arc<Pipeline>, mcp: Option<Arc<McpManager>>, default_provider: impl Into<String>) -> Self {
        Self {
            worker_pool,
            pipeline,
            mcp,
            envelope_pool: Pool::new(DEFAULT_ENVELOPE_POOL_CAP),
            reply_pool: Pool::new(DEFAULT_REPLY_POOL_CAP),
            provider_defaults: RwLock::new(HashMap::new()),
            default_provider: RwLock::new(default_provider.into()),
        }
    }

    pub async fn set_default_provider(&self, provider_id: impl Into<String>) {
        *self.default_provider.write().await = provider_id.into();
    }

    /// Registers a provider with both the worker pool (for admission and
    /// dispatch) and the router's own record of its default timeout (used
    /// to compute the absolute deadline when a request doesn't override
    /// it).
    pub async fn register_provider(
        &self,
        provider_id: impl Into<String>,
        adapter: Arc<dyn axon_provider::ProviderAdapter>,
        config: ProviderNetworkConfig,
    ) {
        let provider_id = provider_id.into();
        self.provider_defaults
            .write()
            .await
            .insert(provider_id.clone(), ProviderDefaults { request_timeout: config.request_timeout });
        self.worker_pool.register_provider(provider_id, adapter, config).await;
    }

    async fn default_timeout_for(&self, provider_id: &str) -> Duration {
        self.provider_defaults
            .read()
            .await
            .get(provider_id)
            .map(|d| d.request_timeout)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Merges the filtered MCP tool catalog into the payload and returns
    /// which client owns each tool name, so a later tool-call response can
    /// be routed back to the client that advertised it.
    async fn merge_mcp_tools(&self, mcp_enabled: bool, overrides: &RequestOverrides, payload: &mut CanonicalPayload) -> HashMap<String, String> {
        let mut tool_owners = HashMap::new();
        if !mcp_enabled {
            return tool_owners;
        }
        let Some(mcp) = &self.mcp else { return tool_owners };
        let include_tools = overrides.mcp_include.as_deref();
        let exclude_tools = overrides.mcp_exclude.as_deref();
        let catalog = mcp.filtered_catalog(None, None, include_tools, exclude_tools).await;
        if let CanonicalPayload::Chat { tools, .. } = payload {
            for (client_id, descriptor) in catalog {
                tool_owners.insert(descriptor.name.clone(), client_id);
                tools.push(ToolDefinition { name: descriptor.name, description: descriptor.description, parameters: descriptor.params_schema });
            }
        }
        tool_owners
    }

    /// Spec §4.6's auto-execute loop: while the latest response carries a
    /// tool call whose client has it in `tools_to_auto_execute`, run it,
    /// append the result to the conversation, and dispatch a continuation
    /// request on the same provider/model. Stops as soon as a response has
    /// no auto-executable tool call left, or `MAX_AUTO_EXECUTE_ROUNDS` is
    /// hit. Returns the final response (or error) plus the extra upstream
    /// calls the continuations cost, for the caller's attempts tally.
    async fn run_mcp_auto_execute(
        &self,
        envelope_snapshot: &RequestEnvelope,
        tool_owners: &HashMap<String, String>,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        mut response: CanonicalResponse,
    ) -> (Result<CanonicalResponse, GatewayError>, u32) {
        if tool_owners.is_empty() {
            return (Ok(response), 0);
        }
        let Some(mcp) = self.mcp.as_ref() else { return (Ok(response), 0) };
        let CanonicalPayload::Chat { tools, max_tokens, temperature, stream, .. } = &envelope_snapshot.payload else {
            return (Ok(response), 0);
        };

        let mut conversation = match &envelope_snapshot.payload {
            CanonicalPayload::Chat { messages, .. } => messages.clone(),
            CanonicalPayload::Raw(_) => return (Ok(response), 0),
        };
        let mut extra_attempts = 0u32;

        for _round in 0..MAX_AUTO_EXECUTE_ROUNDS {
            let Some(last) = response.messages.last() else { break };
            if last.tool_calls.is_empty() {
                break;
            }
            let tool_calls = last.tool_calls.clone();

            conversation.extend(response.messages.clone());
            let mut tool_results = Vec::new();
            for call in &tool_calls {
                let Some(client_id) = tool_owners.get(&call.name) else { continue };
                if !mcp.is_auto_execute(client_id, &call.name).await {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let outcome = mcp.execute_tool(&call.id, client_id, &call.name, call.arguments.clone(), remaining).await;
                let content = match outcome {
                    Ok(result) => result.content.into_iter().map(|part| part.text).collect::<Vec<_>>().join("\n"),
                    Err(err) => format!("tool execution failed: {err}"),
                };
                tool_results.push(ChatMessage { role: Role::Tool, content, tool_calls: Vec::new(), tool_call_id: Some(call.id.clone()) });
            }

            if tool_results.is_empty() {
                // None of this round's tool calls were auto-executable; hand
                // the response back as-is for the host to act on explicitly.
                return (Ok(response), extra_attempts);
            }
            conversation.extend(tool_results);

            if tokio::time::Instant::now() >= deadline {
                let error = GatewayError::new(ErrorKind::Timeout, "deadline exceeded during mcp auto-execute continuation")
                    .with_provider(&envelope_snapshot.provider_id)
                    .with_model(&envelope_snapshot.model_id)
                    .with_attempts(extra_attempts);
                return (Err(error), extra_attempts);
            }

            let mut continuation = self.envelope_pool.acquire();
            continuation.request_id = envelope_snapshot.request_id;
            continuation.provider_id = envelope_snapshot.provider_id.clone();
            continuation.model_id = envelope_snapshot.model_id.clone();
            continuation.kind = envelope_snapshot.kind;
            continuation.payload = CanonicalPayload::Chat {
                messages: conversation.clone(),
                tools: tools.clone(),
                max_tokens: *max_tokens,
                temperature: *temperature,
                stream: *stream,
            };
            continuation.overrides = envelope_snapshot.overrides.clone();
            continuation.trace = envelope_snapshot.trace.clone();

            let mut reply_channel = self.reply_pool.acquire();
            let reply_tx = reply_channel.sender();
            let mut reply_rx = reply_channel.take_receiver();
            let queued = QueuedRequest { envelope: continuation, reply_tx, cancel: cancel.clone(), deadline };

            match self.worker_pool.enqueue(&envelope_snapshot.provider_id, queued).await {
                Err(enqueue_err) => {
                    self.reply_pool.release(reply_channel);
                    let error = enqueue_error_to_gateway(enqueue_err, &envelope_snapshot.provider_id, &envelope_snapshot.model_id);
                    return (Err(error), extra_attempts);
                }
                Ok(()) => {
                    let received = tokio::time::timeout_at(deadline, reply_rx.recv()).await;
                    self.reply_pool.release(reply_channel);
                    match received {
                        Err(_elapsed) => {
                            let error = GatewayError::new(ErrorKind::Timeout, "request deadline exceeded waiting for an mcp continuation reply")
                                .with_provider(&envelope_snapshot.provider_id)
                                .with_model(&envelope_snapshot.model_id)
                                .with_attempts(extra_attempts);
                            return (Err(error), extra_attempts);
                        }
                        Ok(None) => {
                            let error = GatewayError::new(ErrorKind::Network, "worker closed the reply channel without a reply")
                                .with_provider(&envelope_snapshot.provider_id)
                                .with_model(&envelope_snapshot.model_id)
                                .with_attempts(extra_attempts);
                            return (Err(error), extra_attempts);
                        }
                        Ok(Some(WorkOutcome::Unary(Ok(success)))) => {
                            extra_attempts += success.attempts;
                            response = success.response;
                        }
                        Ok(Some(WorkOutcome::Unary(Err(err)))) => {
                            extra_attempts += err.attempts.max(1);
                            return (Err(err), extra_attempts);
                        }
                        Ok(Some(WorkOutcome::Stream { attempts, .. })) => {
                            extra_attempts += attempts;
                            let error = GatewayError::new(ErrorKind::Validation, "mcp auto-execute continuation must not itself stream")
                                .with_provider(&envelope_snapshot.provider_id)
                                .with_model(&envelope_snapshot.model_id)
                                .with_attempts(extra_attempts);
                            return (Err(error), extra_attempts);
                        }
                    }
                }
            }
        }

        (Ok(response), extra_attempts)
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let request_id = RequestId::new();
        let trace = TraceMeta::new();

        let default_provider = self.default_provider.read().await.clone();
        let (primary_provider, primary_model) = resolve_route(&default_provider, &request.model);

        let mut candidates: Vec<(String, String)> = vec![(primary_provider, primary_model)];
        for target in &request.overrides.fallback_chain {
            candidates.push((target.provider_id.clone(), target.model_id.clone()));
        }

        let deadline_timeout = request.overrides.timeout.unwrap_or(self.default_timeout_for(&candidates[0].0).await);
        let deadline = tokio::time::Instant::now() + deadline_timeout;

        let mut base_payload = request.payload.clone();
        let tool_owners = self.merge_mcp_tools(request.mcp_enabled, &request.overrides, &mut base_payload).await;

        let mut total_attempts: u32 = 0;
        let mut idx = 0usize;
        loop {
            let (provider_id, model_id) = candidates[idx].clone();
            let is_last_candidate = idx + 1 >= candidates.len();

            if request.cancel.is_cancelled() {
                let err = GatewayError::new(ErrorKind::Cancelled, "request cancelled before this candidate could be admitted")
                    .with_provider(provider_id)
                    .with_model(model_id)
                    .with_attempts(total_attempts)
                    .allow_fallbacks(false);
                return DispatchOutcome { body: DispatchBody::Unary(Err(err)), attempts: total_attempts, provider_id: candidates[idx].0.clone(), model_id: candidates[idx].1.clone(), request_id };
            }

            if tokio::time::Instant::now() >= deadline {
                let err = GatewayError::new(ErrorKind::Timeout, "request deadline exceeded before this candidate could be attempted")
                    .with_provider(provider_id)
                    .with_model(model_id)
                    .with_attempts(total_attempts)
                    .allow_fallbacks(false);
                return DispatchOutcome { body: DispatchBody::Unary(Err(err)), attempts: total_attempts, provider_id: candidates[idx].0.clone(), model_id: candidates[idx].1.clone(), request_id };
            }

            let mut envelope = self.envelope_pool.acquire();
            envelope.request_id = request_id;
            envelope.provider_id = provider_id.clone();
            envelope.model_id = model_id.clone();
            envelope.kind = request.kind;
            envelope.payload = base_payload.clone();
            envelope.overrides = request.overrides.clone();
            envelope.trace = trace.clone();

            let envelope_snapshot = (*envelope).clone();
            tracing::info!(event = "dispatch_pre_hooks", request_id = %request_id, provider = %provider_id, model = %model_id, candidate = idx, "running plugin pre-hooks");
            let (pre_result, executed) = self.pipeline.run_pre_hooks(envelope).await;

            let (final_result, used_stream): (Result<CanonicalResponse, GatewayError>, Option<mpsc::Receiver<StreamChunk>>) = match pre_result {
                PreHookRun::ShortCircuitResponse(response) => {
                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Ok(response)).await;
                    (outcome, None)
                }
                PreHookRun::ShortCircuitError { error, allow_fallbacks } => {
                    total_attempts += 1;
                    let error = error.allow_fallbacks(allow_fallbacks);
                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Err(error)).await;
                    (outcome, None)
                }
                PreHookRun::Continue(next_envelope) => {
                    let envelope_snapshot = (*next_envelope).clone();
                    let mut reply_channel = self.reply_pool.acquire();
                    let reply_tx = reply_channel.sender();
                    let mut reply_rx = reply_channel.take_receiver();

                    let queued = QueuedRequest { envelope: next_envelope, reply_tx, cancel: request.cancel.clone(), deadline };
                    match self.worker_pool.enqueue(&provider_id, queued).await {
                        Err(enqueue_err) => {
                            total_attempts += 1;
                            self.reply_pool.release(reply_channel);
                            let error = enqueue_error_to_gateway(enqueue_err, &provider_id, &model_id);
                            let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Err(error)).await;
                            (outcome, None)
                        }
                        Ok(()) => {
                            tracing::info!(event = "dispatch_enqueued", request_id = %request_id, provider = %provider_id, candidate = idx, "enqueued to worker pool");
                            let received = tokio::time::timeout_at(deadline, reply_rx.recv()).await;
                            self.reply_pool.release(reply_channel);
                            match received {
                                Err(_elapsed) => {
                                    total_attempts += 1;
                                    let error = GatewayError::new(ErrorKind::Timeout, "request deadline exceeded waiting for a reply")
                                        .with_provider(&provider_id)
                                        .with_model(&model_id);
                                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Err(error)).await;
                                    (outcome, None)
                                }
                                Ok(None) => {
                                    total_attempts += 1;
                                    let error = GatewayError::new(ErrorKind::Network, "worker closed the reply channel without a reply")
                                        .with_provider(&provider_id)
                                        .with_model(&model_id);
                                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Err(error)).await;
                                    (outcome, None)
                                }
                                Ok(Some(WorkOutcome::Unary(Ok(success)))) => {
                                    total_attempts += success.attempts;
                                    let (auto_result, extra_attempts) = self
                                        .run_mcp_auto_execute(&envelope_snapshot, &tool_owners, deadline, &request.cancel, success.response)
                                        .await;
                                    total_attempts += extra_attempts;
                                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, auto_result).await;
                                    (outcome, None)
                                }
                                Ok(Some(WorkOutcome::Unary(Err(err)))) => {
                                    total_attempts += err.attempts.max(1);
                                    let outcome = self.pipeline.run_post_hooks(&executed, &envelope_snapshot, Err(err)).await;
                                    (outcome, None)
                                }
                                Ok(Some(WorkOutcome::Stream { chunks, attempts })) => {
                                    total_attempts += attempts;
                                    (Ok(CanonicalResponse::default()), Some(chunks))
                                }
                            }
                        }
                    }
                }
            };

            if let Some(chunks) = used_stream {
                return DispatchOutcome { body: DispatchBody::Stream { chunks }, attempts: total_attempts, provider_id, model_id, request_id };
            }

            match final_result {
                Ok(response) => {
                    return DispatchOutcome { body: DispatchBody::Unary(Ok(response)), attempts: total_attempts, provider_id, model_id, request_id };
                }
                Err(err) => {
                    if !is_last_candidate && err.allow_fallbacks {
                        tracing::warn!(event = "dispatch_fallback", request_id = %request_id, provider = %provider_id, model = %model_id, kind = %err.kind, "falling back to next candidate");
                        idx += 1;
                        continue;
                    }
                    let err = err.with_attempts(total_attempts);
                    return DispatchOutcome { body: DispatchBody::Unary(Err(err)), attempts: total_attempts, provider_id, model_id, request_id };
                }
            }
        }
    }
}

fn enqueue_error_to_gateway(err: EnqueueError, provider_id: &str, model_id: &str) -> GatewayError {
    let kind = match err {
        EnqueueError::QueueFull | EnqueueError::Draining => ErrorKind::QueueFull,
        EnqueueError::UnknownProvider => ErrorKind::Config,
    };
    GatewayError::new(kind, err.to_string()).with_provider(provider_id).with_model(model_id)
}
