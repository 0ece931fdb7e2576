//! Shared identifiers and error vocabulary used across the request engine.
//!
//! This crate intentionally carries no async runtime or HTTP dependency —
//! every other crate in the workspace depends on it, so it stays minimal.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique id for a single `dispatch()` call, stable across retries and
/// fallbacks for that call (a fresh attempt does not get a new id; only a
/// brand new inbound request does).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trace/correlation metadata threaded through a request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceMeta {
    pub trace_id: Uuid,
    pub parent_request_id: Option<RequestId>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl TraceMeta {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::now_v7(),
            parent_request_id: None,
            started_at: OffsetDateTime::now_utc(),
        }
    }
}

impl Default for TraceMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Error kinds surfaced by the core (spec §7). This is a closed vocabulary,
/// not a type hierarchy — every crate in the workspace maps its local error
/// types down into one of these before it crosses a component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Auth,
    NoKeyForModel,
    QueueFull,
    RateLimit,
    Upstream5xx,
    Upstream4xx,
    Network,
    Timeout,
    Cancelled,
    Translation,
    PluginError,
    McpToolError,
    Config,
}

impl ErrorKind {
    /// Whether a worker may retry in-place (same provider, possibly a new
    /// key) for this error class. Fallbacks are a router-level decision and
    /// are not governed by this method — see spec §9's "retries vs
    /// fallbacks are disjoint" design note.
    pub fn retry_eligible(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Upstream5xx | ErrorKind::Network | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NoKeyForModel => "no-key-for-model",
            ErrorKind::QueueFull => "queue-full",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::Upstream5xx => "upstream-5xx",
            ErrorKind::Upstream4xx => "upstream-4xx",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Translation => "translation",
            ErrorKind::PluginError => "plugin-error",
            ErrorKind::McpToolError => "mcp-tool-error",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// The user-visible shape of a terminal failure (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempts: u32,
    pub allow_fallbacks: bool,
    /// Set only for `plugin-error`: the plugin that raised it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    /// Set only for `mcp-tool-error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_tool_name: Option<String>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            model: None,
            attempts: 0,
            allow_fallbacks: true,
            plugin_name: None,
            mcp_tool_name: None,
            mcp_client_id: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn allow_fallbacks(mut self, allow: bool) -> Self {
        self.allow_fallbacks = allow;
        self
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retry_eligible() {
        assert!(ErrorKind::RateLimit.retry_eligible());
        assert!(ErrorKind::Upstream5xx.retry_eligible());
        assert!(ErrorKind::Network.retry_eligible());
        assert!(ErrorKind::Timeout.retry_eligible());
        assert!(!ErrorKind::Upstream4xx.retry_eligible());
        assert!(!ErrorKind::Auth.retry_eligible());
        assert!(!ErrorKind::Cancelled.retry_eligible());
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
