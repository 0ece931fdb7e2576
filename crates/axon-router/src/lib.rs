//! Top-level entry point (spec §4.7): resolve provider + model, merge MCP
//! tools, run the plugin pipeline around a worker-pool enqueue, and drive
//! the fallback chain on failure.

mod dispatch;
mod route;

pub use dispatch::{DispatchBody, DispatchOutcome, DispatchRequest, Router};
pub use route::resolve_route;
