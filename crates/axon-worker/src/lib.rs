//! Bounded per-provider worker pools (spec §4.4): admission control that
//! never blocks, FIFO dequeue, key selection, retry-with-backoff, streaming
//! chunk delivery, and cooperative cancellation.

mod config;
mod pool_manager;
mod work;

pub use config::ProviderNetworkConfig;
pub use pool_manager::WorkerPoolManager;
pub use work::{EnqueueError, QueuedRequest, WorkOutcome, WorkSuccess};
