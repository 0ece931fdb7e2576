use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params_schema: serde_json::Value,
}

/// Which tools a client is willing to expose or auto-run. `Wildcard`
/// matches anything; `Names` is an explicit set.
#[derive(Debug, Clone)]
pub enum ToolAllowList {
    Wildcard,
    Names(Vec<String>),
}

impl ToolAllowList {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            ToolAllowList::Wildcard => true,
            ToolAllowList::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

impl Default for ToolAllowList {
    fn default() -> Self {
        ToolAllowList::Names(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionKind {
    Stdio { command: String, args: Vec<String>, env: HashMap<String, String> },
    Http { url: String, headers: HashMap<String, String> },
    Sse { url: String, headers: HashMap<String, String> },
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub registration_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub enum AuthMode {
    None,
    Headers(HashMap<String, String>),
    OAuth(OAuthConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connected,
    Failed,
    Expired,
}

/// Static configuration for one MCP client, as loaded from config. Runtime
/// state (connection, catalog) lives on `McpClient` in the registry, not
/// here.
#[derive(Debug, Clone)]
pub struct McpClientRecord {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub auth: AuthMode,
    pub tools_to_execute: ToolAllowList,
    pub tools_to_auto_execute: ToolAllowList,
    pub supports_ping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolResultPart>,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub owning_request_id: axon_common::RequestId,
    pub attempt: u32,
}
