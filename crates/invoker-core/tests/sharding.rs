//! Sharded invocations scheduled on the tokio rescheduler.

use std::sync::Arc;

use invoker_core::{CommandOptions, HostLogBuffer, InvocationExecutor, TokioRescheduler};
use invoker_domain::fakes::{CallLog, StubShardableTest};
use invoker_domain::FailureStatus;

mod common;
use common::{base_config, count, listener, position, single_device_context, FakeShardDevices};

fn sharded_options(count: usize) -> CommandOptions {
    CommandOptions {
        shard_count: Some(count),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sharded_invocation_merges_into_one_stream() {
    let log = CallLog::new();
    let (builder, provider, recording) = base_config(&log);
    let rescheduler = Arc::new(TokioRescheduler::new(Arc::new(FakeShardDevices {
        log: log.clone(),
        fail: false,
    })));
    let host_log = HostLogBuffer::new();
    host_log.append(b"parent before sharding\n");
    let config = builder
        .options(sharded_options(2))
        .host_log(host_log)
        .rescheduler(rescheduler.clone())
        .test(Arc::new(StubShardableTest::new("suite", 2, log.clone())))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("parent invocation");
    assert!(outcome.sharded);
    assert!(outcome.success);

    let shards = rescheduler.wait_all().await;
    assert_eq!(shards.len(), 2);
    for shard in &shards {
        let shard = shard.as_ref().expect("shard invocation");
        assert!(shard.success);
        assert!(!shard.sharded);
    }

    let labels = recording.labels();
    assert_eq!(count(&labels, "invocation_started"), 1);
    assert_eq!(count(&labels, "invocation_ended"), 1);
    assert_eq!(labels.last().map(String::as_str), Some("invocation_ended"));
    assert!(
        position(&labels, "invocation_started")
            < position(&labels, "test_log:host_log_before_sharding")
    );
    assert!(recording.invocation_failures().is_empty());

    let mut runs: Vec<String> = recording.run_starts().into_iter().map(|(name, ..)| name).collect();
    runs.sort();
    assert_eq!(runs, vec!["suite-0", "suite-1"]);

    // The parent never touches its own device once sharded.
    assert_eq!(log.count("serial-1", "pre_invocation_setup"), 0);
    assert_eq!(log.count("shard0-default", "pre_invocation_setup"), 1);
    assert_eq!(log.count("shard1-default", "post_invocation_tear_down"), 1);

    // The parent's record plus one clone per shard.
    assert_eq!(provider.cleaned_builds().len(), 3);
    assert_eq!(log.count("suite", "split"), 1);
}

#[tokio::test]
async fn test_host_log_before_sharding_reaches_every_listener_once() {
    let log = CallLog::new();
    let (builder, _provider, first) = base_config(&log);
    let (second_sink, second) = listener("second");
    let rescheduler = Arc::new(TokioRescheduler::new(Arc::new(FakeShardDevices {
        log: log.clone(),
        fail: false,
    })));
    let host_log = HostLogBuffer::new();
    host_log.append(b"parent before sharding\n");
    let config = builder
        .listener(second_sink)
        .options(sharded_options(2))
        .host_log(host_log)
        .rescheduler(rescheduler.clone())
        .test(Arc::new(StubShardableTest::new("suite", 2, log.clone())))
        .build()
        .expect("config");

    InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("parent invocation");
    for shard in rescheduler.wait_all().await {
        shard.expect("shard invocation");
    }

    for recording in [&first, &second] {
        let labels = recording.labels();
        assert_eq!(count(&labels, "test_log:host_log_before_sharding"), 1);
        assert_eq!(count(&labels, "invocation_started"), 1);
        assert_eq!(count(&labels, "invocation_ended"), 1);
    }
}

#[tokio::test]
async fn test_empty_shard_still_runs_its_bookkeeping() {
    let log = CallLog::new();
    let (builder, provider, recording) = base_config(&log);
    let rescheduler = Arc::new(TokioRescheduler::new(Arc::new(FakeShardDevices {
        log: log.clone(),
        fail: false,
    })));
    let config = builder
        .options(sharded_options(3))
        .rescheduler(rescheduler.clone())
        .test(Arc::new(StubShardableTest::new("suite", 2, log.clone())))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("parent invocation");
    assert!(outcome.sharded);

    let shards = rescheduler.wait_all().await;
    assert_eq!(shards.len(), 3);
    for shard in &shards {
        assert!(shard.as_ref().expect("shard invocation").success);
    }

    // The third shard got no tests but still owns a device.
    assert_eq!(log.count("shard2-default", "pre_invocation_setup"), 1);
    assert_eq!(log.count("shard2-default", "post_invocation_tear_down"), 1);
    assert_eq!(log.count("suite-0", "run") + log.count("suite-1", "run"), 2);

    let labels = recording.labels();
    assert_eq!(count(&labels, "invocation_started"), 1);
    assert_eq!(count(&labels, "invocation_ended"), 1);
    assert_eq!(labels.last().map(String::as_str), Some("invocation_ended"));
    let mut runs: Vec<String> = recording.run_starts().into_iter().map(|(name, ..)| name).collect();
    runs.sort();
    assert_eq!(runs, vec!["suite-0", "suite-1"]);
    assert_eq!(provider.cleaned_builds().len(), 4);
}

#[tokio::test]
async fn test_unschedulable_shards_end_the_stream_with_one_failure() {
    let log = CallLog::new();
    let (builder, provider, recording) = base_config(&log);
    let rescheduler = Arc::new(TokioRescheduler::new(Arc::new(FakeShardDevices {
        log: log.clone(),
        fail: true,
    })));
    let config = builder
        .options(sharded_options(2))
        .rescheduler(rescheduler.clone())
        .test(Arc::new(StubShardableTest::new("suite", 2, log.clone())))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("parent invocation");

    assert!(outcome.sharded);
    assert_eq!(rescheduler.pending(), 0);
    let failures = recording.invocation_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, FailureStatus::Cancelled);
    assert_eq!(failures[0].related.len(), 2);
    assert_eq!(recording.labels().last().map(String::as_str), Some("invocation_ended"));
    assert_eq!(provider.cleaned_builds().len(), 1);
}

#[tokio::test]
async fn test_sharding_without_rescheduler_runs_inline() {
    let log = CallLog::new();
    let (builder, _provider, recording) = base_config(&log);
    let config = builder
        .options(sharded_options(2))
        .test(Arc::new(StubShardableTest::new("suite", 2, log.clone())))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("invocation");

    assert!(!outcome.sharded);
    assert!(outcome.success);
    let runs: Vec<String> = recording.run_starts().into_iter().map(|(name, ..)| name).collect();
    assert_eq!(runs, vec!["suite-0", "suite-1"]);
    assert_eq!(log.count("serial-1", "pre_invocation_setup"), 1);
    assert_eq!(log.count("suite", "split"), 0);
}

#[tokio::test]
async fn test_unsplittable_tests_run_inline() {
    let log = CallLog::new();
    let (builder, _provider, recording) = base_config(&log);
    let rescheduler = Arc::new(TokioRescheduler::new(Arc::new(FakeShardDevices {
        log: log.clone(),
        fail: false,
    })));
    let config = builder
        .options(sharded_options(2))
        .rescheduler(rescheduler.clone())
        .test(Arc::new(StubShardableTest::new("suite", 1, log.clone())))
        .build()
        .expect("config");

    let outcome = InvocationExecutor::new(config)
        .invoke(single_device_context("serial-1", &log))
        .await
        .expect("invocation");

    assert!(!outcome.sharded);
    assert_eq!(rescheduler.pending(), 0);
    assert_eq!(log.count("suite", "split"), 1);
    assert_eq!(recording.run_starts().len(), 1);
    assert!(!recording
        .labels()
        .contains(&"test_log:host_log_before_sharding".to_string()));
}
