//! Structured observability hooks for invocation lifecycle events.
//!
//! This module provides:
//! - An invocation-scoped span ([`invocation_span`]) that the executor
//!   instruments its future with
//! - Emission functions for key lifecycle events: start, phase transitions,
//!   fetch/cleanup failures, sharding, retries, finish
//!
//! Events are emitted at `info!` level (filtered through `RUST_LOG`).

use tracing::{info, warn};
use uuid::Uuid;

use invoker_domain::ActionInProgress;

/// Span tagging every event of one invocation with its id and test tag.
///
/// # Example
///
/// ```ignore
/// executor.invoke(context).instrument(invocation_span(id, "suite")).await
/// ```
pub fn invocation_span(invocation_id: Uuid, test_tag: &str) -> tracing::Span {
    tracing::info_span!("invoker.invocation", invocation_id = %invocation_id, test_tag = %test_tag)
}

/// Emit event: invocation started on the given devices.
pub fn emit_invocation_started(invocation_id: Uuid, serials: &[String]) {
    info!(
        event = "invocation.started",
        invocation_id = %invocation_id,
        devices = %serials.join(","),
    );
}

/// Emit event: the executor moved to a new phase.
pub fn emit_phase_started(invocation_id: Uuid, action: ActionInProgress) {
    info!(event = "invocation.phase", invocation_id = %invocation_id, action = %action);
}

/// Emit event: invocation finished with duration and success status.
pub fn emit_invocation_finished(invocation_id: Uuid, duration_ms: u64, success: bool) {
    info!(
        event = "invocation.finished",
        invocation_id = %invocation_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: a failure was reported to the listeners.
pub fn emit_invocation_failed(invocation_id: Uuid, action: ActionInProgress, message: &str) {
    warn!(
        event = "invocation.failed",
        invocation_id = %invocation_id,
        action = %action,
        message = %message,
    );
}

/// Emit event: build fetch for a slot failed.
pub fn emit_fetch_failed(slot: &str, error: &dyn std::fmt::Display) {
    warn!(event = "fetch.failed", slot = %slot, error = %error);
}

/// Emit event: a build cleanup failed (warning level, never fatal).
pub fn emit_cleanup_failed(build_id: &str, provider: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "fetch.cleanup_failed",
        build_id = %build_id,
        provider = %provider,
        error = %error,
    );
}

/// Emit event: a preparer failed during tear down; tear down continues.
pub fn emit_teardown_error(preparer: &str, error: &dyn std::fmt::Display) {
    warn!(event = "preparer.teardown_error", preparer = %preparer, error = %error);
}

/// Emit event: the invocation was split into shards.
pub fn emit_sharded(invocation_id: Uuid, shard_count: usize, scheduled: usize) {
    info!(
        event = "shard.scheduled",
        invocation_id = %invocation_id,
        shard_count = shard_count,
        scheduled = scheduled,
    );
}

/// Emit event: one attempt of a run finished.
pub fn emit_attempt_finished(test: &str, attempt: u32, failed: bool) {
    info!(event = "retry.attempt", test = %test, attempt = attempt, failed = failed);
}
