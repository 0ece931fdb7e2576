//! Prometheus text exposition (spec §6, `/metrics`). Counters are plain
//! atomics updated from the dispatch handler — there is no metrics crate in
//! the dependency stack, so exposition is a small hand-rolled text builder
//! rather than a framework.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    dispatch_total: AtomicU64,
    dispatch_failures_total: AtomicU64,
    upstream_calls_total: AtomicU64,
    in_flight: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_dispatch(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// `attempts` is the dispatch-wide upstream call count (spec §8
    /// scenario 1); `failed` marks whether the terminal outcome was an
    /// error.
    pub fn finish_dispatch(&self, attempts: u32, failed: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.dispatch_total.fetch_add(1, Ordering::Relaxed);
        self.upstream_calls_total.fetch_add(attempts as u64, Ordering::Relaxed);
        if failed {
            self.dispatch_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE axon_dispatch_total counter");
        let _ = writeln!(out, "axon_dispatch_total {}", self.dispatch_total.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE axon_dispatch_failures_total counter");
        let _ = writeln!(out, "axon_dispatch_failures_total {}", self.dispatch_failures_total.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE axon_upstream_calls_total counter");
        let _ = writeln!(out, "axon_upstream_calls_total {}", self.upstream_calls_total.load(Ordering::Relaxed));
        let _ = writeln!(out, "# TYPE axon_dispatch_in_flight gauge");
        let _ = writeln!(out, "axon_dispatch_in_flight {}", self.in_flight.load(Ordering::Relaxed));
        out
    }
}
