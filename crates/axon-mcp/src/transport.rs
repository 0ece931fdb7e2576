use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to spawn child process: {0}")]
    Spawn(String),
    #[error("i/o error talking to the client: {0}")]
    Io(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("the client returned a JSON-RPC error: {0}")]
    Rpc(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One request/response round trip over whatever transport a client uses.
/// `list_tools`/`call_tool` are expressed in terms of this, so the registry
/// doesn't need to know which connection kind it's talking to.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError>;
}

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn envelope(method: &str, params: serde_json::Value, id: u64) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

fn unwrap_response(value: serde_json::Value) -> Result<serde_json::Value, TransportError> {
    if let Some(error) = value.get("error") {
        return Err(TransportError::Rpc(error.to_string()));
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| TransportError::Malformed("response missing both `result` and `error`".into()))
}

/// A stdio-framed MCP server: one JSON object per line on stdin, one per
/// line on stdout. The child is kept alive for the lifetime of the client.
pub struct StdioTransport {
    child: Mutex<Child>,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| TransportError::Spawn(e.to_string()))?;
        Ok(Self { child: Mutex::new(child) })
    }
}

#[async_trait]
impl JsonRpcTransport for StdioTransport {
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        let id = next_id();
        let line = serde_json::to_string(&envelope(method, params, id)).map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut child = self.child.lock().await;
        let stdin = child.stdin.as_mut().ok_or(TransportError::NotConnected)?;
        stdin.write_all(line.as_bytes()).await.map_err(|e| TransportError::Io(e.to_string()))?;
        stdin.write_all(b"\n").await.map_err(|e| TransportError::Io(e.to_string()))?;

        let stdout = child.stdout.as_mut().ok_or(TransportError::NotConnected)?;
        let mut reader = BufReader::new(stdout);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.map_err(|e| TransportError::Io(e.to_string()))?;
        if response_line.is_empty() {
            return Err(TransportError::Io("child process closed stdout".into()));
        }
        let parsed: serde_json::Value =
            serde_json::from_str(response_line.trim()).map_err(|e| TransportError::Malformed(e.to_string()))?;
        unwrap_response(parsed)
    }
}

/// An HTTP JSON-RPC MCP server: one POST per call, headers carry auth.
pub struct HttpTransport {
    client: wreq::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self { client: wreq::Client::new(), url: url.into(), headers }
    }

    pub fn set_bearer_token(&mut self, token: &str) {
        self.headers.insert("authorization".into(), format!("Bearer {token}"));
    }
}

#[async_trait]
impl JsonRpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        let id = next_id();
        let mut req = self.client.post(&self.url).json(&envelope(method, params, id));
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(|e| TransportError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("status {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| TransportError::Malformed(e.to_string()))?;
        unwrap_response(body)
    }
}

/// An SSE-carried MCP server: requests go over the same POST channel as
/// `HttpTransport`; the distinguishing behavior (the server may instead
/// push results over a long-lived `text/event-stream`) lives in the
/// connection-establishment step, not in per-call request/response shape.
pub struct SseTransport {
    inner: HttpTransport,
}

impl SseTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self { inner: HttpTransport::new(url, headers) }
    }
}

#[async_trait]
impl JsonRpcTransport for SseTransport {
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        self.inner.request(method, params).await
    }
}
