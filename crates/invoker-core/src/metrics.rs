//! Per-invocation atomic counters and phase timings.
//!
//! Counters are incremented silently at the call site. Call
//! [`InvocationMetrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of an invocation. Each invocation owns
//! its own instance; nothing here is process-wide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use invoker_domain::ActionInProgress;

/// Lightweight atomic counters, no allocations, no locking.
#[derive(Debug, Default)]
pub struct InvocationMetrics {
    fetch_ms: AtomicU64,
    setup_ms: AtomicU64,
    test_ms: AtomicU64,
    teardown_ms: AtomicU64,
    test_attempts: AtomicU64,
    cleanup_failures: AtomicU64,
    logs_saved: AtomicU64,
}

impl InvocationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the time spent in a phase.
    pub fn record_phase(&self, action: ActionInProgress, elapsed: Duration) {
        let counter = match action {
            ActionInProgress::FetchingArtifacts => &self.fetch_ms,
            ActionInProgress::Setup => &self.setup_ms,
            ActionInProgress::Test => &self.test_ms,
            ActionInProgress::TearDown => &self.teardown_ms,
            _ => return,
        };
        counter.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn inc_test_attempts(&self) {
        self.test_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "test_attempts", "counter incremented");
    }

    pub fn add_cleanup_failures(&self, count: u64) {
        self.cleanup_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_logs_saved(&self) {
        self.logs_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn test_attempts(&self) -> u64 {
        self.test_attempts.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> u64 {
        self.cleanup_failures.load(Ordering::Relaxed)
    }

    /// Current values as `(key, value)` pairs, in a stable order.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        [
            ("fetch_build_time_ms", &self.fetch_ms),
            ("setup_time_ms", &self.setup_ms),
            ("test_time_ms", &self.test_ms),
            ("teardown_time_ms", &self.teardown_ms),
            ("test_attempts", &self.test_attempts),
            ("build_cleanup_failures", &self.cleanup_failures),
            ("logs_saved", &self.logs_saved),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed).to_string()))
        .collect()
    }

    /// Emit all current values as a single `info!` event.
    pub fn flush(&self, invocation_id: &str) {
        tracing::info!(
            metric = "flush",
            invocation_id = %invocation_id,
            fetch_build_time_ms = self.fetch_ms.load(Ordering::Relaxed),
            setup_time_ms = self.setup_ms.load(Ordering::Relaxed),
            test_time_ms = self.test_ms.load(Ordering::Relaxed),
            teardown_time_ms = self.teardown_ms.load(Ordering::Relaxed),
            test_attempts = self.test_attempts(),
            build_cleanup_failures = self.cleanup_failures(),
            logs_saved = self.logs_saved.load(Ordering::Relaxed),
        );
    }
}
