use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use wreq::{Client, StatusCode};

use crate::adapter::{AdapterError, CapabilitySet, ModelDescriptor, ProviderAdapter};
use crate::envelope::{
    CanonicalPayload, CanonicalResponse, ChatMessage, RequestEnvelope, Role, StreamChunk, ToolCall,
    Usage,
};

const PROVIDER_ID: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Reference adapter for OpenAI's chat completions dialect. Only the chat
/// request kind is translated; anything else is turned down at
/// `capabilities()` before it ever reaches `call`.
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    catalog: Vec<ModelDescriptor>,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            catalog: vec![
                ModelDescriptor { model_id: "gpt-4o".into(), context_window: Some(128_000), supports_tools: true },
                ModelDescriptor { model_id: "gpt-4o-mini".into(), context_window: Some(128_000), supports_tools: true },
            ],
        }
    }

    fn translate_request(envelope: &RequestEnvelope) -> Result<serde_json::Value, AdapterError> {
        let CanonicalPayload::Chat { messages, tools, max_tokens, temperature, stream } = &envelope.payload
        else {
            return Err(AdapterError::Translation(
                "openai adapter only understands the chat payload form".into(),
            ));
        };

        let mut body = json!({
            "model": envelope.model_id,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "stream": *stream,
        });
        let obj = body.as_object_mut().expect("constructed above as an object");
        if !tools.is_empty() {
            obj.insert(
                "tools".into(),
                json!(tools
                    .iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
                    }))
                    .collect::<Vec<_>>()),
            );
        }
        if let Some(max_tokens) = max_tokens {
            obj.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        Ok(body)
    }

    fn translate_response(body: &serde_json::Value) -> Result<CanonicalResponse, AdapterError> {
        let choices = body
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AdapterError::Translation("response missing `choices`".into()))?;

        let messages = choices
            .iter()
            .filter_map(|c| c.get("message"))
            .map(message_from_wire)
            .collect::<Result<Vec<_>, _>>()?;

        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        });

        Ok(CanonicalResponse { messages, usage, raw: Some(body.clone()) })
    }

    fn classify_error_status(status: StatusCode, body: String) -> AdapterError {
        match status.as_u16() {
            401 | 403 => AdapterError::Auth(body),
            429 => AdapterError::RateLimit { retry_after: None },
            400..=499 => AdapterError::Upstream4xx { status: status.as_u16(), body },
            _ => AdapterError::Upstream5xx { status: status.as_u16(), body },
        }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn message_to_wire(m: &ChatMessage) -> serde_json::Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({ "role": role, "content": m.content });
    if let Some(obj) = wire.as_object_mut() {
        if !m.tool_calls.is_empty() {
            obj.insert(
                "tool_calls".into(),
                json!(m
                    .tool_calls
                    .iter()
                    .map(|t| json!({
                        "id": t.id,
                        "type": "function",
                        "function": { "name": t.name, "arguments": t.arguments.to_string() },
                    }))
                    .collect::<Vec<_>>()),
            );
        }
        if let Some(id) = &m.tool_call_id {
            obj.insert("tool_call_id".into(), json!(id));
        }
    }
    wire
}

fn message_from_wire(m: &serde_json::Value) -> Result<ChatMessage, AdapterError> {
    let role = match m.get("role").and_then(|r| r.as_str()) {
        Some("system") => Role::System,
        Some("user") => Role::User,
        Some("tool") => Role::Tool,
        _ => Role::Assistant,
    };
    let content = m.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
    let tool_calls = m
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(serde_json::Value::Null);
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatMessage { role, content, tool_calls, tool_call_id: None })
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet { chat: true, streaming: true, tool_calls: true, embeddings: false, audio: false }
    }

    fn model_catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    async fn call(
        &self,
        envelope: &RequestEnvelope,
        api_key: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        let body = Self::translate_request(envelope)?;
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| AdapterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify_error_status(status, text));
        }
        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| AdapterError::Translation(e.to_string()))?;
        Self::translate_response(&parsed)
    }

    async fn call_streaming(
        &self,
        envelope: &RequestEnvelope,
        api_key: &str,
        sink: Sender<StreamChunk>,
    ) -> Result<(), AdapterError> {
        use futures_util::StreamExt;

        let mut body = Self::translate_request(envelope)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".into(), json!(true));
        }

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = Self::classify_error_status(status, text);
            let _ = sink.send(StreamChunk::Error { error: to_gateway_error(&err) }).await;
            return Err(err);
        }

        let mut stream = resp.bytes_stream();
        let mut buffered = String::new();
        let mut assembled_content = String::new();
        let mut tool_calls_by_index: std::collections::BTreeMap<u64, PartialToolCall> =
            std::collections::BTreeMap::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AdapterError::Network(e.to_string()))?;
            buffered.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffered.find("\n\n") {
                let event = buffered[..pos].to_string();
                buffered.drain(..pos + 2);
                let Some(data) = event.strip_prefix("data: ") else { continue };
                if data.trim() == "[DONE]" {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                let Some(delta_obj) = parsed.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta"))
                else {
                    continue;
                };
                let content = delta_obj.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();

                let mut touched_indices = Vec::new();
                if let Some(tc_deltas) = delta_obj.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc_delta in tc_deltas {
                        let index = tc_delta.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        let entry = tool_calls_by_index.entry(index).or_default();
                        if let Some(id) = tc_delta.get("id").and_then(|v| v.as_str()) {
                            entry.id.push_str(id);
                        }
                        if let Some(function) = tc_delta.get("function") {
                            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                                entry.name.push_str(name);
                            }
                            if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                                entry.arguments.push_str(args);
                            }
                        }
                        touched_indices.push(index);
                    }
                }

                if content.is_empty() && touched_indices.is_empty() {
                    continue;
                }
                assembled_content.push_str(&content);
                let deltas = touched_indices
                    .into_iter()
                    .filter_map(|idx| tool_calls_by_index.get(&idx).map(|p| p.to_tool_call()))
                    .collect();
                let _ = sink.send(StreamChunk::Delta { content, tool_call_deltas: deltas }).await;
            }
        }

        let tool_calls = tool_calls_by_index.values().map(PartialToolCall::to_tool_call).collect();
        let assembled = CanonicalResponse {
            messages: vec![ChatMessage {
                role: Role::Assistant,
                content: assembled_content,
                tool_calls,
                tool_call_id: None,
            }],
            usage: None,
            raw: None,
        };
        let _ = sink.send(StreamChunk::Terminal { assembled }).await;
        Ok(())
    }
}

/// Accumulates a streamed tool call across SSE fragments: OpenAI sends the
/// `id`/`function.name` once and `function.arguments` in incremental pieces,
/// all keyed by the same `index` within `choices[0].delta.tool_calls`.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    /// `arguments` is parsed best-effort since it's incomplete JSON until the
    /// final fragment arrives; callers that need the fully-formed call should
    /// read it off the `Terminal` chunk instead of a mid-stream `Delta`.
    fn to_tool_call(&self) -> ToolCall {
        let arguments = serde_json::from_str(&self.arguments).unwrap_or(serde_json::Value::Null);
        ToolCall { id: self.id.clone(), name: self.name.clone(), arguments }
    }
}

fn to_gateway_error(err: &AdapterError) -> axon_common::GatewayError {
    axon_common::GatewayError::new(err.kind(), err.to_string()).with_provider(PROVIDER_ID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestOverrides;
    use axon_common::{RequestId, TraceMeta};
    use crate::envelope::RequestKind;

    fn chat_envelope() -> RequestEnvelope {
        RequestEnvelope {
            request_id: RequestId::new(),
            provider_id: PROVIDER_ID.into(),
            model_id: "gpt-4o-mini".into(),
            kind: RequestKind::Chat,
            payload: CanonicalPayload::Chat {
                messages: vec![ChatMessage {
                    role: Role::User,
                    content: "hello".into(),
                    tool_calls: vec![],
                    tool_call_id: None,
                }],
                tools: vec![],
                max_tokens: Some(64),
                temperature: None,
                stream: false,
            },
            overrides: RequestOverrides::default(),
            trace: TraceMeta::new(),
        }
    }

    #[test]
    fn translate_request_carries_model_and_messages() {
        let envelope = chat_envelope();
        let wire = OpenAiAdapter::translate_request(&envelope).unwrap();
        assert_eq!(wire["model"], "gpt-4o-mini");
        assert_eq!(wire["messages"][0]["role"], "user");
        assert_eq!(wire["max_tokens"], 64);
    }

    #[test]
    fn translate_request_rejects_non_chat_payload() {
        let mut envelope = chat_envelope();
        envelope.payload = CanonicalPayload::Raw(serde_json::json!({}));
        assert!(OpenAiAdapter::translate_request(&envelope).is_err());
    }

    #[test]
    fn translate_response_extracts_usage_and_message() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hi there" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 },
        });
        let response = OpenAiAdapter::translate_response(&body).unwrap();
        assert_eq!(response.messages[0].content, "hi there");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn status_429_maps_to_rate_limit() {
        let err = OpenAiAdapter::classify_error_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into());
        assert!(matches!(err, AdapterError::RateLimit { .. }));
    }
}
