mod client;
mod oauth;
mod registry;
mod transport;

pub use client::{
    AuthMode, ConnectionKind, ConnectionState, McpClientRecord, OAuthConfig, ToolAllowList, ToolCallRecord, ToolDescriptor,
    ToolResult, ToolResultPart,
};
pub use oauth::{generate_pkce, generate_state, OAuthFlowManager, PendingAuthorizationHandle, PkceCodes};
pub use registry::{McpError, McpManager};
pub use transport::{HttpTransport, JsonRpcTransport, SseTransport, StdioTransport, TransportError};
