//! Invoker Core Library
//!
//! The invocation execution engine: fetch builds, prepare devices, run
//! (retried, sharded or sandboxed) tests, tear down and report.

pub mod collector;
pub mod config;
pub mod executor;
pub mod fetch;
pub mod forwarder;
pub mod log_saver;
pub mod log_tracker;
pub mod metrics;
pub mod obs;
pub mod preparer;
pub mod processor;
pub mod rescheduler;
pub mod retry;
pub mod sandbox;
pub mod shard;
pub mod telemetry;

pub use collector::{
    with_auto_collectors, LogcatOnFailure, MetricCollectorChain, ScreenshotOnFailure,
};
pub use config::{
    AutoCollector, CommandOptions, InvocationConfig, InvocationConfigBuilder, RetryConfig,
    RetryStrategy,
};
pub use executor::{
    InvocationExecutor, InvocationOutcome, RunMode, StopHandle, BUILD_ERROR_BUGREPORT,
    DEVICE_LOG_NAME_PREFIX, DEVICE_UNRESPONSIVE_BUGREPORT, HOST_LOG_BEFORE_SHARDING,
    INVOCATION_ENDED_BUGREPORT, SHARD_COUNT_KEY, SHARD_INDEX_KEY, TARGET_SETUP_ERROR_BUGREPORT,
};
pub use fetch::{
    BuildFetcher, CleanupFailure, CleanupReport, ExistingBuildProvider, FetchFailure, FetchedBuild,
    FetchedBuilds,
};
pub use forwarder::{LogSaverForwarder, ResultForwarder, SharedSink};
pub use log_saver::{FileLogSaver, InMemoryLogSaver};
pub use log_tracker::{EventScope, LogAssociationTracker, ShardListener};
pub use metrics::InvocationMetrics;
pub use preparer::{PreparerChain, PreparerPhase, PreparerSpec};
pub use processor::PostProcessorChain;
pub use rescheduler::{ShardResourceFactory, ShardResources, TokioRescheduler};
pub use retry::{AttemptSink, ResultAggregator, RetryCoordinator, RetryStatistics};
pub use sandbox::{
    CommandResult, CommandStatus, EventStreamSink, ProcessSandbox, Sandbox, SandboxEvent,
    SandboxRequest,
};
pub use shard::{
    Rescheduler, ShardBuild, ShardCoordinator, ShardInvocation, ShardMainForwarder, ShardPlan,
};
pub use telemetry::{init_tracing, init_tracing_with_host_log, HostLogBuffer};
