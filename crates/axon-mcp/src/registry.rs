use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::client::{ConnectionKind, ConnectionState, McpClientRecord, ToolDescriptor, ToolResult, ToolResultPart};
use crate::transport::{HttpTransport, JsonRpcTransport, SseTransport, StdioTransport, TransportError};

#[derive(Debug, Error)]
pub enum McpError {
    #[error("unknown mcp client `{0}`")]
    UnknownClient(String),
    #[error("tool `{0}` is not allowed for this client")]
    ToolNotAllowed(String),
    #[error("call id `{0}` already has a request in flight")]
    AlreadyInFlight(String),
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

fn state_to_u8(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Pending => 0,
        ConnectionState::Connected => 1,
        ConnectionState::Failed => 2,
        ConnectionState::Expired => 3,
    }
}

fn u8_to_state(v: u8) -> ConnectionState {
    match v {
        1 => ConnectionState::Connected,
        2 => ConnectionState::Failed,
        3 => ConnectionState::Expired,
        _ => ConnectionState::Pending,
    }
}

struct McpClient {
    record: McpClientRecord,
    transport: Arc<dyn JsonRpcTransport>,
    catalog: ArcSwap<Vec<ToolDescriptor>>,
    state: AtomicU8,
}

/// Bounded-heap reconnect scheduler — the same shape as the key selector's
/// cooldown recovery, applied to MCP client reconnection instead of
/// credential cooldowns.
struct ReconnectQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    notify: Notify,
}

impl ReconnectQueue {
    fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), notify: Notify::new() }
    }

    async fn push(&self, at: Instant, client_id: String) {
        self.heap.lock().await.push(Reverse((at, client_id)));
        self.notify.notify_one();
    }

    fn spawn_recover_task(self: Arc<Self>, clients: Arc<RwLock<HashMap<String, Arc<McpClient>>>>, health: Arc<HealthCheckQueue>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, id))| (*t, id.clone()))
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => tokio::time::sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, _))) = heap.peek() {
                        if *t > now {
                            break;
                        }
                        let Reverse((t, id)) = heap.pop().unwrap();
                        due.push((t, id));
                    }
                }
                if due.is_empty() {
                    continue;
                }

                for (_t, client_id) in due {
                    let client = {
                        let clients = clients.read().await;
                        clients.get(&client_id).cloned()
                    };
                    let Some(client) = client else { continue };
                    match client.transport.request("tools/list", serde_json::json!({})).await {
                        Ok(result) => {
                            if let Ok(tools) = serde_json::from_value::<Vec<ToolDescriptor>>(
                                result.get("tools").cloned().unwrap_or(result),
                            ) {
                                client.catalog.store(Arc::new(tools));
                            }
                            client.state.store(state_to_u8(ConnectionState::Connected), Ordering::Release);
                            tracing::info!(event = "mcp_reconnected", client = %client_id, "mcp client reconnected");
                            health.push(Instant::now() + HEALTH_CHECK_INTERVAL, client_id).await;
                        }
                        Err(_) => {
                            client.state.store(state_to_u8(ConnectionState::Failed), Ordering::Release);
                        }
                    }
                }
            }
        });
    }
}

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic liveness check for already-`Connected` clients (spec §4.6): a
/// client that supports `ping` is pinged, otherwise `tools/list` doubles as
/// the health probe. A successful check reschedules itself; a failed one
/// hands the client to the `ReconnectQueue` instead of rescheduling, so the
/// two queues never fight over the same client.
struct HealthCheckQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    notify: Notify,
}

impl HealthCheckQueue {
    fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), notify: Notify::new() }
    }

    async fn push(&self, at: Instant, client_id: String) {
        self.heap.lock().await.push(Reverse((at, client_id)));
        self.notify.notify_one();
    }

    fn spawn_loop(self: Arc<Self>, clients: Arc<RwLock<HashMap<String, Arc<McpClient>>>>, reconnect: Arc<ReconnectQueue>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, id))| (*t, id.clone()))
                };
                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => tokio::time::sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, _))) = heap.peek() {
                        if *t > now {
                            break;
                        }
                        let Reverse((t, id)) = heap.pop().unwrap();
                        due.push((t, id));
                    }
                }
                if due.is_empty() {
                    continue;
                }

                for (_t, client_id) in due {
                    let client = {
                        let clients = clients.read().await;
                        clients.get(&client_id).cloned()
                    };
                    let Some(client) = client else { continue };
                    if u8_to_state(client.state.load(Ordering::Acquire)) != ConnectionState::Connected {
                        // Not our job to bring it back; the reconnect queue owns that.
                        continue;
                    }
                    let method = if client.record.supports_ping { "ping" } else { "tools/list" };
                    match client.transport.request(method, serde_json::json!({})).await {
                        Ok(_) => {
                            self.push(Instant::now() + HEALTH_CHECK_INTERVAL, client_id).await;
                        }
                        Err(e) => {
                            tracing::warn!(event = "mcp_health_check_failed", client = %client_id, error = %e, "health check failed, scheduling reconnect");
                            client.state.store(state_to_u8(ConnectionState::Failed), Ordering::Release);
                            reconnect.push(Instant::now() + Duration::from_secs(5), client_id).await;
                        }
                    }
                }
            }
        });
    }
}

pub struct McpManager {
    clients: Arc<RwLock<HashMap<String, Arc<McpClient>>>>,
    in_flight: Mutex<HashSet<String>>,
    reconnect: Arc<ReconnectQueue>,
    health: Arc<HealthCheckQueue>,
}

impl McpManager {
    pub fn new() -> Self {
        let clients = Arc::new(RwLock::new(HashMap::new()));
        let reconnect = Arc::new(ReconnectQueue::new());
        let health = Arc::new(HealthCheckQueue::new());
        reconnect.clone().spawn_recover_task(clients.clone(), health.clone());
        health.clone().spawn_loop(clients.clone(), reconnect.clone());
        Self { clients, in_flight: Mutex::new(HashSet::new()), reconnect, health }
    }

    fn build_transport(record: &McpClientRecord) -> Result<Arc<dyn JsonRpcTransport>, McpError> {
        match &record.kind {
            ConnectionKind::Stdio { command, args, env } => {
                Ok(Arc::new(StdioTransport::spawn(command, args, env).map_err(McpError::Transport)?))
            }
            ConnectionKind::Http { url, headers } => Ok(Arc::new(HttpTransport::new(url.clone(), headers.clone()))),
            ConnectionKind::Sse { url, headers } => Ok(Arc::new(SseTransport::new(url.clone(), headers.clone()))),
        }
    }

    /// Establishes the transport and runs the initial `tools/list`. On
    /// failure the client is registered in `Failed` state and scheduled for
    /// a reconnect attempt rather than dropped.
    pub async fn register_client(&self, record: McpClientRecord) -> Result<(), McpError> {
        let client_id = record.id.clone();
        let transport = match Self::build_transport(&record) {
            Ok(t) => t,
            Err(e) => {
                self.reconnect.push(Instant::now() + Duration::from_secs(5), client_id).await;
                return Err(e);
            }
        };
        self.register_client_with_transport(record, transport).await
    }

    /// Same as [`Self::register_client`], but with the transport supplied
    /// directly rather than built from `record.kind` — lets an embedder plug
    /// in a transport this crate doesn't construct on its own (or a test
    /// double standing in for a real MCP server).
    pub async fn register_client_with_transport(&self, record: McpClientRecord, transport: Arc<dyn JsonRpcTransport>) -> Result<(), McpError> {
        let client_id = record.id.clone();
        let client = Arc::new(McpClient {
            record,
            transport,
            catalog: ArcSwap::from_pointee(Vec::new()),
            state: AtomicU8::new(state_to_u8(ConnectionState::Pending)),
        });
        self.clients.write().await.insert(client_id.clone(), client.clone());

        match client.transport.request("tools/list", serde_json::json!({})).await {
            Ok(result) => {
                let tools: Vec<ToolDescriptor> =
                    serde_json::from_value(result.get("tools").cloned().unwrap_or(result)).unwrap_or_default();
                client.catalog.store(Arc::new(tools));
                client.state.store(state_to_u8(ConnectionState::Connected), Ordering::Release);
                self.health.push(Instant::now() + HEALTH_CHECK_INTERVAL, client_id).await;
                Ok(())
            }
            Err(e) => {
                client.state.store(state_to_u8(ConnectionState::Failed), Ordering::Release);
                self.reconnect.push(Instant::now() + Duration::from_secs(5), client_id).await;
                Err(McpError::Transport(e))
            }
        }
    }

    pub async fn connection_state(&self, client_id: &str) -> Option<ConnectionState> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|c| u8_to_state(c.state.load(Ordering::Acquire)))
    }

    /// Tool catalog filtered by the client's own allow-list, then by the
    /// request-level include/exclude sets (intersection, per spec §4.6).
    pub async fn filtered_catalog(
        &self,
        include_clients: Option<&[String]>,
        exclude_clients: Option<&[String]>,
        include_tools: Option<&[String]>,
        exclude_tools: Option<&[String]>,
    ) -> Vec<(String, ToolDescriptor)> {
        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for (client_id, client) in clients.iter() {
            if u8_to_state(client.state.load(Ordering::Acquire)) != ConnectionState::Connected {
                continue;
            }
            if let Some(include) = include_clients {
                if !include.iter().any(|c| c == client_id) {
                    continue;
                }
            }
            if let Some(exclude) = exclude_clients {
                if exclude.iter().any(|c| c == client_id) {
                    continue;
                }
            }
            for tool in client.catalog.load().iter() {
                if !client.record.tools_to_execute.allows(&tool.name) {
                    continue;
                }
                if let Some(include) = include_tools {
                    if !include.iter().any(|t| t == &tool.name) {
                        continue;
                    }
                }
                if let Some(exclude) = exclude_tools {
                    if exclude.iter().any(|t| t == &tool.name) {
                        continue;
                    }
                }
                out.push((client_id.clone(), tool.clone()));
            }
        }
        out
    }

    pub async fn is_auto_execute(&self, client_id: &str, tool_name: &str) -> bool {
        let clients = self.clients.read().await;
        clients
            .get(client_id)
            .map(|c| c.record.tools_to_auto_execute.allows(tool_name))
            .unwrap_or(false)
    }

    /// At-most-one in-flight call per `call_id`, bounded by `deadline`, with
    /// a superficial JSON-schema `required` check before dispatch.
    pub async fn execute_tool(
        &self,
        call_id: &str,
        client_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolResult, McpError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(call_id.to_string()) {
                return Err(McpError::AlreadyInFlight(call_id.to_string()));
            }
        }
        let result = self.execute_tool_inner(client_id, tool_name, arguments, deadline).await;
        self.in_flight.lock().await.remove(call_id);
        result
    }

    async fn execute_tool_inner(
        &self,
        client_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolResult, McpError> {
        let client = {
            let clients = self.clients.read().await;
            clients.get(client_id).cloned()
        };
        let Some(client) = client else {
            return Ok(denial_result(&format!("unknown mcp client `{client_id}`")));
        };
        if !client.record.tools_to_execute.allows(tool_name) {
            return Ok(denial_result(&format!("tool `{tool_name}` is not enabled for this client")));
        }
        if let Some(schema) = client.catalog.load().iter().find(|t| t.name == tool_name).map(|t| t.params_schema.clone()) {
            if let Some(missing) = first_missing_required_field(&schema, &arguments) {
                return Ok(denial_result(&format!("missing required argument `{missing}`")));
            }
        }

        let call = client.transport.request("tools/call", serde_json::json!({ "name": tool_name, "arguments": arguments }));
        let response = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| McpError::DeadlineExceeded)?
            .map_err(McpError::Transport)?;

        Ok(canonicalize_result(response))
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

fn first_missing_required_field(schema: &serde_json::Value, arguments: &serde_json::Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    for field in required {
        let field_name = field.as_str()?;
        if arguments.get(field_name).is_none() {
            return Some(field_name.to_string());
        }
    }
    None
}

fn denial_result(reason: &str) -> ToolResult {
    ToolResult { content: vec![ToolResultPart { text: reason.to_string() }], is_error: true }
}

fn canonicalize_result(raw: serde_json::Value) -> ToolResult {
    let is_error = raw.get("isError").or_else(|| raw.get("is_error")).and_then(|v| v.as_bool()).unwrap_or(false);
    let content = raw
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| ToolResultPart {
                    text: item.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_else(|| vec![ToolResultPart { text: raw.to_string() }]);
    ToolResult { content, is_error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JsonRpcTransport for FakeTransport {
        async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match method {
                "tools/list" => Ok(serde_json::json!({
                    "tools": [{ "name": "lookup", "description": "look something up", "params_schema": { "required": ["q"] } }]
                })),
                "tools/call" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let args = params.get("arguments").cloned().unwrap_or_default();
                    Ok(serde_json::json!({ "content": [{ "text": format!("got {}", args) }], "isError": false }))
                }
                other => Err(TransportError::Malformed(format!("unexpected method {other}"))),
            }
        }
    }

    async fn manager_with_fake_client() -> (McpManager, String) {
        let manager = McpManager::new();
        let client_id = "demo".to_string();
        let client = Arc::new(McpClient {
            record: McpClientRecord {
                id: client_id.clone(),
                name: "demo".into(),
                kind: ConnectionKind::Http { url: "http://unused".into(), headers: HashMap::new() },
                auth: crate::client::AuthMode::None,
                tools_to_execute: crate::client::ToolAllowList::Wildcard,
                tools_to_auto_execute: crate::client::ToolAllowList::Names(vec!["lookup".into()]),
                supports_ping: false,
            },
            transport: Arc::new(FakeTransport { calls: AtomicU32::new(0) }),
            catalog: ArcSwap::from_pointee(vec![ToolDescriptor {
                name: "lookup".into(),
                description: "look something up".into(),
                params_schema: serde_json::json!({ "required": ["q"] }),
            }]),
            state: AtomicU8::new(state_to_u8(ConnectionState::Connected)),
        });
        manager.clients.write().await.insert(client_id.clone(), client);
        (manager, client_id)
    }

    #[tokio::test]
    async fn execute_tool_rejects_missing_required_argument() {
        let (manager, client_id) = manager_with_fake_client().await;
        let result = manager
            .execute_tool("call-1", &client_id, "lookup", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn execute_tool_succeeds_with_required_argument_present() {
        let (manager, client_id) = manager_with_fake_client().await;
        let result = manager
            .execute_tool("call-1", &client_id, "lookup", serde_json::json!({ "q": "weather" }), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn concurrent_calls_with_same_call_id_are_rejected() {
        let (manager, client_id) = manager_with_fake_client().await;
        let manager = Arc::new(manager);
        let first = {
            let manager = manager.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                manager.execute_tool("dup", &client_id, "lookup", serde_json::json!({ "q": "1" }), Duration::from_secs(1)).await
            })
        };
        // Give the first call a head start so it's holding the in-flight slot
        // by the time the second call is issued.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = manager.execute_tool("dup", &client_id, "lookup", serde_json::json!({ "q": "2" }), Duration::from_secs(1)).await;

        let _ = first.await.unwrap();
        assert!(matches!(second, Err(McpError::AlreadyInFlight(_))));
    }

    #[tokio::test]
    async fn auto_execute_allowlist_is_respected() {
        let (manager, client_id) = manager_with_fake_client().await;
        assert!(manager.is_auto_execute(&client_id, "lookup").await);
        assert!(!manager.is_auto_execute(&client_id, "other_tool").await);
    }
}
