//! Observability tests for invocation lifecycle tracing.
//!
//! The emitters must never panic, whatever subscriber is installed, and
//! the host log capture must see the executor's events.

use std::sync::Arc;

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_test::traced_test;
use uuid::Uuid;

use invoker_core::obs::{
    emit_attempt_finished, emit_cleanup_failed, emit_invocation_failed, emit_invocation_finished,
    emit_invocation_started, emit_phase_started, emit_sharded, invocation_span,
};
use invoker_core::{HostLogBuffer, InvocationExecutor};
use invoker_domain::fakes::{CallLog, StubTest, TestOutcome};
use invoker_domain::ActionInProgress;

mod common;
use common::{base_config, single_device_context};

#[traced_test]
#[test]
fn test_lifecycle_emitters_do_not_panic() {
    let id = Uuid::new_v4();
    let span = invocation_span(id, "suite");
    let _entered = span.enter();

    emit_invocation_started(id, &["serial-1".to_string(), "serial-2".to_string()]);
    emit_phase_started(id, ActionInProgress::Setup);
    emit_attempt_finished("suite", 0, false);
    emit_sharded(id, 4, 3);
    emit_cleanup_failed("1000", "provider", &"disk full");
    emit_invocation_failed(id, ActionInProgress::Test, "device lost");
    emit_invocation_finished(id, 1200, false);
}

#[traced_test]
#[tokio::test]
async fn test_invocation_runs_under_traced_subscriber() {
    let log = CallLog::new();
    let (builder, _provider, recording) = base_config(&log);
    let config = builder
        .test(Arc::new(StubTest::new("suite", log.clone()).with_case("case", TestOutcome::Pass)))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("invocation");

    assert!(outcome.success);
    assert_eq!(recording.labels().last().map(String::as_str), Some("invocation_ended"));
}

#[tokio::test]
async fn test_host_log_captures_executor_events() {
    let buffer = HostLogBuffer::new();
    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_ansi(false)
            .with_writer(buffer.clone()),
    );
    let _guard = tracing::subscriber::set_default(subscriber);

    let log = CallLog::new();
    let (builder, _provider, recording) = base_config(&log);
    let config = builder
        .host_log(buffer.clone())
        .test(Arc::new(StubTest::new("suite", log.clone()).with_case("case", TestOutcome::Pass)))
        .build()
        .expect("config");

    InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("invocation");

    assert!(recording.labels().contains(&"test_log:host_log".to_string()));
    assert!(recording.associations().contains(&"host_log".to_string()));

    // Events after the host log was reported stay in the buffer.
    let rest = buffer.take().expect("events after host log");
    let text = String::from_utf8_lossy(rest.as_bytes()).to_string();
    assert!(text.contains("free_resources"));
}
