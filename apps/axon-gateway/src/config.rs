//! JSON configuration document (spec §6): provider records, plugin records,
//! and MCP client records, plus a passthrough bucket for the remaining
//! top-level keys (`auth_config`, `governance`, `vector_store`,
//! `config_store`, `logs_store`, `cluster_config`, `saml_config`,
//! `load_balancer_config`, `guardrails_config`, `audit_logs`) whose owners
//! are out-of-scope collaborators. The loader must not fail just because
//! those keys are present.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use axon_mcp::{AuthMode, ConnectionKind as McpConnectionKind, McpClientRecord, OAuthConfig, ToolAllowList};
use axon_provider::KeyRecord;
use axon_worker::ProviderNetworkConfig;
use serde::Deserialize;

use crate::cli::CliArgs;

#[derive(Debug, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers_config: Vec<ProviderConfigEntry>,
    #[serde(default)]
    pub plugins: Vec<PluginConfigEntry>,
    #[serde(default)]
    pub mcp: Vec<McpConfigEntry>,
    /// Everything else: recognized-but-out-of-scope keys plus anything
    /// unrecognized. Parsed and kept around so a caller can inspect it, but
    /// never interpreted here.
    #[serde(flatten)]
    pub passthrough: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct KeyConfigEntry {
    pub id: String,
    /// A literal secret, or `env.<NAME>` to read it from the environment at
    /// load time (spec §6's `env.<NAME>` indirection).
    pub secret: String,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfigEntry {
    pub name: String,
    /// `"openai"` or `"anthropic"` select the two reference adapters; any
    /// other value is rejected at load time (spec §4.2 leaves custom
    /// provider types to the host application, which this core is not).
    pub adapter: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub keys: Vec<KeyConfigEntry>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

fn default_concurrency() -> usize {
    4
}

fn default_buffer_size() -> usize {
    64
}

impl ProviderConfigEntry {
    pub fn network_config(&self) -> ProviderNetworkConfig {
        let defaults = ProviderNetworkConfig::default();
        ProviderNetworkConfig {
            concurrency: self.concurrency,
            buffer_size: self.buffer_size,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.request_timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff: self.initial_backoff_ms.map(Duration::from_millis).unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff_ms.map(Duration::from_millis).unwrap_or(defaults.max_backoff),
        }
    }

    pub fn key_records(&self) -> Result<Vec<KeyRecord>> {
        self.keys
            .iter()
            .map(|k| {
                Ok(KeyRecord {
                    id: k.id.clone(),
                    secret: resolve_secret(&k.secret)?,
                    allowed_models: k.allowed_models.clone(),
                    weight: k.weight,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct PluginConfigEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Filesystem path or built-in identifier (spec §4.5's plugin record
    /// `load source`). No dynamic loader ships with this core — an entry
    /// whose `path` does not match a built-in id is logged and skipped
    /// rather than failing the whole config load.
    pub path: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum McpConnectionEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct McpOAuthEntry {
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub registration_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct McpConfigEntry {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub connection: McpConnectionEntry,
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<McpOAuthEntry>,
    /// `None` means every tool the client advertises is callable
    /// (wildcard); `Some(names)` is an explicit allow-list.
    #[serde(default)]
    pub tools_to_execute: Option<Vec<String>>,
    #[serde(default)]
    pub tools_to_auto_execute: Option<Vec<String>>,
    #[serde(default)]
    pub supports_ping: bool,
}

impl McpConfigEntry {
    pub fn into_record(self) -> Result<McpClientRecord> {
        let kind = match self.connection {
            McpConnectionEntry::Stdio { command, args, env } => McpConnectionKind::Stdio { command, args, env },
            McpConnectionEntry::Http { url, headers } => McpConnectionKind::Http { url, headers },
            McpConnectionEntry::Sse { url, headers } => McpConnectionKind::Sse { url, headers },
        };

        let auth = if let Some(oauth) = self.oauth {
            AuthMode::OAuth(OAuthConfig {
                authorize_url: oauth.authorize_url,
                token_url: oauth.token_url,
                registration_url: oauth.registration_url,
                client_id: oauth.client_id,
                client_secret: oauth.client_secret.map(|s| resolve_secret(&s)).transpose()?,
                scope: oauth.scope,
                redirect_uri: oauth.redirect_uri,
            })
        } else if self.auth_headers.is_empty() {
            AuthMode::None
        } else {
            let mut resolved = HashMap::with_capacity(self.auth_headers.len());
            for (k, v) in self.auth_headers {
                resolved.insert(k, resolve_secret(&v)?);
            }
            AuthMode::Headers(resolved)
        };

        Ok(McpClientRecord {
            id: self.id,
            name: self.name,
            kind,
            auth,
            tools_to_execute: allow_list(self.tools_to_execute),
            tools_to_auto_execute: allow_list(self.tools_to_auto_execute),
            supports_ping: self.supports_ping,
        })
    }
}

fn allow_list(names: Option<Vec<String>>) -> ToolAllowList {
    match names {
        None => ToolAllowList::Wildcard,
        Some(names) => ToolAllowList::Names(names),
    }
}

/// Resolves the `env.<NAME>` indirection spec §6 uses for secret material.
/// A value with no `env.` prefix is returned verbatim.
pub fn resolve_secret(raw: &str) -> Result<String> {
    match raw.strip_prefix("env.") {
        Some(var) => std::env::var(var)
            .with_context(|| format!("environment variable `{var}` referenced by `env.{var}` is not set")),
        None => Ok(raw.to_string()),
    }
}

/// Loads the config document from, in order: the CLI `--config` path, the
/// `AXON_CONFIG` environment variable (either inline JSON or a path to one,
/// matching spec §6's "inline config JSON, overrides file path" wording).
pub fn load(cli: &CliArgs) -> Result<ConfigDocument> {
    let raw = if let Some(path) = &cli.config {
        fs::read_to_string(path).with_context(|| format!("reading config file `{path}`"))?
    } else if let Ok(inline) = std::env::var("AXON_CONFIG") {
        let trimmed = inline.trim().to_string();
        if trimmed.starts_with('{') {
            trimmed
        } else {
            fs::read_to_string(&trimmed).with_context(|| format!("reading config file `{trimmed}` named by AXON_CONFIG"))?
        }
    } else {
        anyhow::bail!("no configuration source: pass --config <path> or set AXON_CONFIG");
    };

    serde_json::from_str(&raw).context("parsing configuration document")
}
