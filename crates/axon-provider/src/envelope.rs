use std::time::Duration;

use axon_common::{GatewayError, RequestId, TraceMeta};
use axon_pool::Poolable;
use serde::{Deserialize, Serialize};

/// The dispatch-time shape of a request. Each variant is a distinct wire
/// contract on the provider side (chat vs. embeddings vs. audio, streaming
/// vs. not) even though they share the same envelope and routing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    #[default]
    Chat,
    ChatStream,
    TextCompletion,
    Embedding,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
    ResponsesApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// The wire-agnostic request body. `Chat` covers the common case every
/// adapter must understand; `Raw` is an escape hatch for request kinds this
/// engine routes but doesn't interpret (left for an adapter to inspect
/// directly).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "kebab-case")]
pub enum CanonicalPayload {
    Chat {
        messages: Vec<ChatMessage>,
        #[serde(default)]
        tools: Vec<ToolDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(default)]
        stream: bool,
    },
    Raw(serde_json::Value),
}

impl Default for CanonicalPayload {
    fn default() -> Self {
        CanonicalPayload::Raw(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackTarget {
    pub provider_id: String,
    pub model_id: String,
}

/// Per-request knobs that override provider/global defaults. All optional —
/// `None` means "use whatever the provider config says".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub fallback_chain: Vec<FallbackTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_fallbacks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_exclude: Option<Vec<String>>,
    #[serde(default)]
    pub plugin_bypass: Vec<String>,
}

impl RequestOverrides {
    /// `allow_fallbacks = None` is treated as `Some(true)` (resolved Open
    /// Question: unset means fallbacks are allowed).
    pub fn allow_fallbacks_resolved(&self) -> bool {
        self.allow_fallbacks.unwrap_or(true)
    }
}

/// A pooled, reusable request envelope. `provider_id`/`model_id` start empty
/// and are filled in by the router after route resolution.
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub provider_id: String,
    pub model_id: String,
    pub kind: RequestKind,
    pub payload: CanonicalPayload,
    pub overrides: RequestOverrides,
    pub trace: TraceMeta,
}

impl Poolable for RequestEnvelope {
    fn reset(&mut self) {
        self.request_id = RequestId::new();
        self.provider_id.clear();
        self.model_id.clear();
        self.kind = RequestKind::default();
        self.payload = CanonicalPayload::default();
        self.overrides = RequestOverrides::default();
        self.trace = TraceMeta::new();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// A streamed chunk of a response. `Terminal` carries the fully assembled
/// record so auto-execute (axon-mcp) can inspect complete tool calls without
/// re-parsing the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    Delta {
        content: String,
        #[serde(default)]
        tool_call_deltas: Vec<ToolCall>,
    },
    Terminal {
        assembled: CanonicalResponse,
    },
    Error {
        error: GatewayError,
    },
}

/// A pooled, reusable response envelope. Holds at most one outcome; `reset`
/// clears it back to `None` so a stale result can never leak into the next
/// borrower.
#[derive(Debug, Default)]
pub struct ResponseEnvelope {
    pub result: Option<Result<CanonicalResponse, GatewayError>>,
}

impl ResponseEnvelope {
    pub fn success(&mut self, response: CanonicalResponse) {
        self.result = Some(Ok(response));
    }

    pub fn failure(&mut self, error: GatewayError) {
        self.result = Some(Err(error));
    }

    pub fn take(&mut self) -> Option<Result<CanonicalResponse, GatewayError>> {
        self.result.take()
    }
}

impl Poolable for ResponseEnvelope {
    fn reset(&mut self) {
        self.result = None;
    }
}
