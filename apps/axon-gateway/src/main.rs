use std::process::ExitCode;
use std::sync::Arc;

use axon_mcp::McpManager;
use axon_plugin::Pipeline;
use axon_provider::adapters::{AnthropicAdapter, OpenAiAdapter};
use axon_provider::KeySelector;
use axon_router::Router;
use axon_worker::WorkerPoolManager;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod http;
mod metrics;

use cli::CliArgs;

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();
    init_tracing(cli.log_level.as_deref().unwrap_or("info"));

    let doc = match config::load(&cli) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!(event = "config_load_failed", error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let key_selector = Arc::new(KeySelector::new());
    let worker_pool = Arc::new(WorkerPoolManager::new(key_selector.clone()));
    let pipeline = Arc::new(Pipeline::new());

    for plugin in &doc.plugins {
        if !plugin.enabled {
            tracing::info!(event = "plugin_skipped", name = %plugin.name, "plugin disabled in config");
            continue;
        }
        // No dynamic plugin loader ships with this core (spec §4.5's "path
        // or built-in id" load source is a host-application concern here);
        // a configured plugin is acknowledged but the pipeline stays as
        // whatever the embedding application registers via `Pipeline::set_plugins`.
        tracing::warn!(event = "plugin_not_loaded", name = %plugin.name, path = %plugin.path, "no built-in plugin matches this load source; skipping");
    }

    let mcp_manager = if doc.mcp.is_empty() {
        None
    } else {
        let manager = Arc::new(McpManager::new());
        for entry in doc.mcp {
            let client_id = entry.id.clone();
            let record = match entry.into_record() {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(event = "config_load_failed", client = %client_id, error = %e, "invalid mcp client config");
                    return ExitCode::from(1);
                }
            };
            if let Err(e) = manager.register_client(record).await {
                tracing::warn!(event = "mcp_client_registration_failed", client = %client_id, error = %e, "mcp client registered in failed state; will retry");
            }
        }
        Some(manager)
    };

    let default_provider = doc.default_provider.clone().unwrap_or_else(|| {
        doc.providers_config.first().map(|p| p.name.clone()).unwrap_or_default()
    });
    let router = Arc::new(Router::new(worker_pool.clone(), pipeline, mcp_manager, default_provider));

    let mut provider_ids = Vec::with_capacity(doc.providers_config.len());
    for provider in &doc.providers_config {
        let adapter: Arc<dyn axon_provider::ProviderAdapter> = match provider.adapter.as_str() {
            "openai" => match &provider.base_url {
                Some(url) => Arc::new(OpenAiAdapter::with_base_url(url.clone())),
                None => Arc::new(OpenAiAdapter::new()),
            },
            "anthropic" => match &provider.base_url {
                Some(url) => Arc::new(AnthropicAdapter::with_base_url(url.clone())),
                None => Arc::new(AnthropicAdapter::new()),
            },
            other => {
                tracing::error!(event = "config_load_failed", provider = %provider.name, adapter = %other, "unknown adapter");
                return ExitCode::from(1);
            }
        };

        let keys = match provider.key_records() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(event = "config_load_failed", provider = %provider.name, error = %e, "invalid key config");
                return ExitCode::from(1);
            }
        };
        for key in keys {
            key_selector.register(provider.name.clone(), key).await;
        }

        router.register_provider(provider.name.clone(), adapter, provider.network_config()).await;
        provider_ids.push(provider.name.clone());
        tracing::info!(event = "provider_registered", provider = %provider.name, adapter = %provider.adapter, "provider registered");
    }

    let metrics = Arc::new(metrics::Metrics::new());
    let app_state = Arc::new(http::AppState { router, metrics });
    let app = http::build_router(app_state);

    let host = cli.host.or(doc.host).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = cli.port.or(doc.port).unwrap_or(8080);
    let bind = format!("{host}:{port}");

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(event = "bind_failed", addr = %bind, error = %e, "failed to bind HTTP listener");
            return ExitCode::from(2);
        }
    };

    tracing::info!(event = "listening", addr = %bind, "axon-gateway ready");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(worker_pool, provider_ids))
        .await
    {
        tracing::error!(event = "serve_failed", error = %e, "HTTP server exited with an error");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal(worker_pool: Arc<WorkerPoolManager>, provider_ids: Vec<String>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(event = "shutdown_requested", "draining provider queues before exit");
    for provider_id in provider_ids {
        worker_pool.shutdown_provider(&provider_id).await;
    }
}
