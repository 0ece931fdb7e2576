use std::time::Duration;

/// Per-provider network and queueing settings. `concurrency` is the worker
/// count; `buffer_size` is the bounded queue depth. The invariant
/// `concurrency <= buffer_size` (both > 0) is the provider record's, not
/// re-validated here — callers construct this from already-validated config.
#[derive(Debug, Clone)]
pub struct ProviderNetworkConfig {
    pub concurrency: usize,
    pub buffer_size: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ProviderNetworkConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            buffer_size: 64,
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}
