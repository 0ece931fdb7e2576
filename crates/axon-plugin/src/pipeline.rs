use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axon_common::{ErrorKind, GatewayError};
use axon_provider::{CanonicalResponse, RequestEnvelope};
use futures_util::FutureExt;

use crate::plugin::{Plugin, PreHookOutcome};

/// What pre-hook execution produced, along with the plugins that actually
/// ran (so post-hooks can replay them in reverse regardless of how far the
/// chain got).
pub enum PreHookRun {
    Continue(Box<RequestEnvelope>),
    ShortCircuitResponse(CanonicalResponse),
    ShortCircuitError { error: GatewayError, allow_fallbacks: bool },
}

/// Ordered, hot-reloadable plugin chain. The snapshot is swapped atomically
/// (`ArcSwap`) so a reload never observes a half-updated list mid-request.
pub struct Pipeline {
    plugins: ArcSwap<Vec<Arc<dyn Plugin>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { plugins: ArcSwap::from_pointee(Vec::new()) }
    }

    /// Replaces the whole chain. Callers are expected to have already
    /// sorted by priority.
    pub fn set_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) {
        self.plugins.store(Arc::new(plugins));
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Plugin>>> {
        self.plugins.load_full()
    }

    /// Runs pre-hooks `P[1]..P[k]` where `k` short-circuits, or all of them.
    /// Returns the executed prefix so post-hooks can run over exactly that
    /// set, in reverse.
    pub async fn run_pre_hooks(&self, envelope: Box<RequestEnvelope>) -> (PreHookRun, Vec<Arc<dyn Plugin>>) {
        let snapshot = self.snapshot();
        let mut current = envelope;
        let mut executed = Vec::with_capacity(snapshot.len());

        for plugin in snapshot.iter() {
            executed.push(plugin.clone());
            let result = AssertUnwindSafe(plugin.pre_hook(current)).catch_unwind().await;
            match result {
                Ok(PreHookOutcome::Continue(next)) => {
                    current = next;
                }
                Ok(PreHookOutcome::ShortCircuitResponse(response)) => {
                    return (PreHookRun::ShortCircuitResponse(response), executed);
                }
                Ok(PreHookOutcome::ShortCircuitError { error, allow_fallbacks }) => {
                    return (
                        PreHookRun::ShortCircuitError { error, allow_fallbacks: allow_fallbacks.unwrap_or(true) },
                        executed,
                    );
                }
                Err(_panic) => {
                    tracing::error!(event = "plugin_panic", plugin = %plugin.name(), stage = "pre", "plugin panicked; short-circuiting with an error");
                    let error = GatewayError::new(ErrorKind::PluginError, format!("plugin `{}` panicked in pre_hook", plugin.name()))
                        .with_attempts(0);
                    return (PreHookRun::ShortCircuitError { error, allow_fallbacks: true }, executed);
                }
            }
        }

        (PreHookRun::Continue(current), executed)
    }

    /// Runs post-hooks over `executed` in reverse order, regardless of
    /// whether the provider was actually called. A panicking plugin's
    /// post-hook is isolated to that plugin: its contribution becomes an
    /// error, but every other plugin's post-hook still runs.
    pub async fn run_post_hooks(
        &self,
        executed: &[Arc<dyn Plugin>],
        envelope: &RequestEnvelope,
        mut outcome: Result<CanonicalResponse, GatewayError>,
    ) -> Result<CanonicalResponse, GatewayError> {
        for plugin in executed.iter().rev() {
            let result = AssertUnwindSafe(plugin.post_hook(envelope, outcome)).catch_unwind().await;
            outcome = match result {
                Ok(next) => next,
                Err(_panic) => {
                    tracing::error!(event = "plugin_panic", plugin = %plugin.name(), stage = "post", "plugin panicked in post_hook");
                    Err(GatewayError::new(ErrorKind::PluginError, format!("plugin `{}` panicked in post_hook", plugin.name())))
                }
            };
        }
        outcome
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
