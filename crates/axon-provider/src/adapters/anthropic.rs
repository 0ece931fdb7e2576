use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use wreq::{Client, StatusCode};

use crate::adapter::{AdapterError, CapabilitySet, ModelDescriptor, ProviderAdapter};
use crate::envelope::{
    CanonicalPayload, CanonicalResponse, ChatMessage, RequestEnvelope, Role, StreamChunk, ToolCall,
    Usage,
};

const PROVIDER_ID: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Reference adapter for Anthropic's Messages API. System messages are
/// lifted out of the message list into the top-level `system` field, which
/// is the one structural difference from the OpenAI dialect that matters
/// here.
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    catalog: Vec<ModelDescriptor>,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            catalog: vec![
                ModelDescriptor { model_id: "claude-sonnet-4-5".into(), context_window: Some(200_000), supports_tools: true },
            ],
        }
    }

    fn translate_request(envelope: &RequestEnvelope) -> Result<serde_json::Value, AdapterError> {
        let CanonicalPayload::Chat { messages, tools, max_tokens, temperature, stream } = &envelope.payload
        else {
            return Err(AdapterError::Translation(
                "anthropic adapter only understands the chat payload form".into(),
            ));
        };

        let system: Vec<&str> = messages
            .iter()
            .filter(|m| matches!(m.role, Role::System))
            .map(|m| m.content.as_str())
            .collect();
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(message_to_wire)
            .collect();

        let mut body = json!({
            "model": envelope.model_id,
            "messages": wire_messages,
            "max_tokens": max_tokens.unwrap_or(4096),
            "stream": *stream,
        });
        let obj = body.as_object_mut().expect("constructed above as an object");
        if !system.is_empty() {
            obj.insert("system".into(), json!(system.join("\n\n")));
        }
        if let Some(temperature) = temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        if !tools.is_empty() {
            obj.insert(
                "tools".into(),
                json!(tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    }))
                    .collect::<Vec<_>>()),
            );
        }
        Ok(body)
    }

    fn translate_response(body: &serde_json::Value) -> Result<CanonicalResponse, AdapterError> {
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AdapterError::Translation("response missing `content`".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or_default());
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                    tool_calls.push(ToolCall { id, name, arguments });
                }
                _ => {}
            }
        }

        let usage = body.get("usage").map(|u| {
            let prompt_tokens = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let completion_tokens = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            Usage { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
        });

        Ok(CanonicalResponse {
            messages: vec![ChatMessage { role: Role::Assistant, content: text, tool_calls, tool_call_id: None }],
            usage,
            raw: Some(body.clone()),
        })
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

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn message_to_wire(m: &ChatMessage) -> serde_json::Value {
    let role = match m.role {
        Role::User | Role::Tool => "user",
        _ => "assistant",
    };
    if !m.tool_calls.is_empty() {
        let blocks: Vec<serde_json::Value> = m
            .tool_calls
            .iter()
            .map(|t| json!({ "type": "tool_use", "id": t.id, "name": t.name, "input": t.arguments }))
            .collect();
        return json!({ "role": role, "content": blocks });
    }
    if let Some(tool_call_id) = &m.tool_call_id {
        return json!({
            "role": "user",
            "content": [{ "type": "tool_result", "tool_use_id": tool_call_id, "content": m.content }],
        });
    }
    json!({ "role": role, "content": m.content })
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
                let Some(data_line) = event.lines().find_map(|l| l.strip_prefix("data: ")) else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data_line) else { continue };
                let index = parsed.get("index").and_then(|i| i.as_u64()).unwrap_or(0);

                match parsed.get("type").and_then(|t| t.as_str()) {
                    Some("content_block_start") => {
                        let block = parsed.get("content_block");
                        if block.and_then(|b| b.get("type")).and_then(|t| t.as_str()) == Some("tool_use") {
                            let entry = tool_calls_by_index.entry(index).or_default();
                            if let Some(id) = block.and_then(|b| b.get("id")).and_then(|v| v.as_str()) {
                                entry.id.push_str(id);
                            }
                            if let Some(name) = block.and_then(|b| b.get("name")).and_then(|v| v.as_str()) {
                                entry.name.push_str(name);
                            }
                        }
                    }
                    Some("content_block_delta") => {
                        let delta_obj = parsed.get("delta");
                        let text = delta_obj.and_then(|d| d.get("text")).and_then(|t| t.as_str());
                        if let Some(text) = text {
                            if !text.is_empty() {
                                assembled_content.push_str(text);
                                let _ = sink
                                    .send(StreamChunk::Delta { content: text.to_string(), tool_call_deltas: vec![] })
                                    .await;
                            }
                            continue;
                        }
                        let partial_json =
                            delta_obj.and_then(|d| d.get("partial_json")).and_then(|t| t.as_str());
                        if let Some(fragment) = partial_json {
                            let entry = tool_calls_by_index.entry(index).or_default();
                            entry.arguments.push_str(fragment);
                            let delta = entry.to_tool_call();
                            let _ = sink
                                .send(StreamChunk::Delta { content: String::new(), tool_call_deltas: vec![delta] })
                                .await;
                        }
                    }
                    _ => {}
                }
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

/// Accumulates a streamed tool call across SSE fragments: Anthropic opens
/// the block with `id`/`name` in `content_block_start`, then streams the
/// `input` object's JSON in `partial_json` fragments keyed by the same
/// block `index`.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    /// `arguments` is incomplete JSON until the last fragment lands; callers
    /// that need the fully-formed call should read it off the `Terminal`
    /// chunk instead of a mid-stream `Delta`.
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
    use crate::envelope::{RequestKind, RequestOverrides};
    use axon_common::{RequestId, TraceMeta};

    fn chat_envelope() -> RequestEnvelope {
        RequestEnvelope {
            request_id: RequestId::new(),
            provider_id: PROVIDER_ID.into(),
            model_id: "claude-sonnet-4-5".into(),
            kind: RequestKind::Chat,
            payload: CanonicalPayload::Chat {
                messages: vec![
                    ChatMessage { role: Role::System, content: "be terse".into(), tool_calls: vec![], tool_call_id: None },
                    ChatMessage { role: Role::User, content: "hello".into(), tool_calls: vec![], tool_call_id: None },
                ],
                tools: vec![],
                max_tokens: Some(128),
                temperature: None,
                stream: false,
            },
            overrides: RequestOverrides::default(),
            trace: TraceMeta::new(),
        }
    }

    #[test]
    fn system_messages_are_lifted_out_of_the_message_list() {
        let envelope = chat_envelope();
        let wire = AnthropicAdapter::translate_request(&envelope).unwrap();
        assert_eq!(wire["system"], "be terse");
        assert_eq!(wire["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn translate_response_splits_text_and_tool_use_blocks() {
        let body = json!({
            "content": [
                { "type": "text", "text": "let me check" },
                { "type": "tool_use", "id": "call_1", "name": "lookup", "input": { "q": "weather" } },
            ],
            "usage": { "input_tokens": 10, "output_tokens": 4 },
        });
        let response = AnthropicAdapter::translate_response(&body).unwrap();
        assert_eq!(response.messages[0].content, "let me check");
        assert_eq!(response.messages[0].tool_calls[0].name, "lookup");
        assert_eq!(response.usage.unwrap().total_tokens, 14);
    }
}
