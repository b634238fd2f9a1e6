//! Collaborator traits consumed by the execution engine.
//!
//! Optional capabilities are expressed as defaulted methods that the engine
//! checks when it composes an invocation (`wants_invocation_context`,
//! `capabilities`, `as_shardable`, `as_log_source`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::build::BuildRecord;
use crate::collector::CollectorSet;
use crate::context::InvocationContext;
use crate::device::Device;
use crate::error::{InvocationError, Result};
use crate::result::{LogData, LogDataType, LogFile, RunMetrics, TestDescription};
use crate::sink::ResultSink;
use crate::test_info::TestInformation;

// ---------------------------------------------------------------------------
// Build provider
// ---------------------------------------------------------------------------

/// What a provider is asked for: the slot and its device, plus the context
/// when the provider declared it needs one.
pub struct BuildRequest<'a> {
    pub slot: &'a str,
    pub device: &'a Arc<dyn Device>,
    pub context: Option<&'a InvocationContext>,
}

#[async_trait]
pub trait BuildProvider: Send + Sync {
    fn name(&self) -> &str;

    fn wants_invocation_context(&self) -> bool {
        false
    }

    /// `Ok(None)` means no build is available to test.
    async fn get_build(&self, request: &BuildRequest<'_>) -> Result<Option<BuildRecord>>;

    /// Release everything `build` holds. Called exactly once per record.
    async fn clean_up(&self, build: &BuildRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Preparers
// ---------------------------------------------------------------------------

/// A log captured by a component outside the result stream.
#[derive(Debug, Clone)]
pub struct CapturedLog {
    pub name: String,
    pub data_type: LogDataType,
    pub data: LogData,
}

pub trait LogSource: Send + Sync {
    /// Hand over (and forget) every log captured since the last call.
    fn drain_logs(&self) -> Vec<CapturedLog>;
}

#[async_trait]
pub trait Preparer: Send + Sync {
    fn name(&self) -> &str;

    /// Gates both setup and tear down.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Gates tear down only.
    fn is_tear_down_disabled(&self) -> bool {
        false
    }

    async fn set_up(&self, info: &TestInformation) -> Result<()>;

    /// `cause` is the error that triggered tear down, `None` after a clean run.
    async fn tear_down(&self, _info: &TestInformation, _cause: Option<&InvocationError>) -> Result<()> {
        Ok(())
    }

    fn as_log_source(&self) -> Option<&dyn LogSource> {
        None
    }
}

// ---------------------------------------------------------------------------
// Test runnables
// ---------------------------------------------------------------------------

/// Extra inputs a test declares it wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCapabilities {
    pub device_aware: bool,
    pub collector_aware: bool,
    pub context_aware: bool,
}

/// Inputs of one attempt. Optional fields are only filled when the test
/// declared the matching capability.
pub struct TestRunInput<'a> {
    pub info: &'a TestInformation,
    pub attempt: u32,
    pub device: Option<Arc<dyn Device>>,
    pub collectors: Option<&'a CollectorSet>,
    pub context: Option<&'a InvocationContext>,
}

impl<'a> TestRunInput<'a> {
    pub fn new(info: &'a TestInformation) -> Self {
        Self {
            info,
            attempt: 0,
            device: None,
            collectors: None,
            context: None,
        }
    }

    /// Fill optional inputs according to `capabilities`.
    pub fn for_capabilities(
        info: &'a TestInformation,
        capabilities: TestCapabilities,
        collectors: &'a CollectorSet,
    ) -> Self {
        Self {
            info,
            attempt: 0,
            device: if capabilities.device_aware {
                info.device().cloned()
            } else {
                None
            },
            collectors: capabilities.collector_aware.then_some(collectors),
            context: capabilities.context_aware.then(|| info.context()),
        }
    }

    pub fn with_attempt(&self, attempt: u32) -> TestRunInput<'a> {
        TestRunInput {
            info: self.info,
            attempt,
            device: self.device.clone(),
            collectors: self.collectors,
            context: self.context,
        }
    }
}

#[async_trait]
pub trait RemoteTest: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> TestCapabilities {
        TestCapabilities::default()
    }

    async fn run(&self, input: &TestRunInput<'_>, sink: &mut dyn ResultSink) -> Result<()>;

    fn as_shardable(&self) -> Option<&dyn ShardableTest> {
        None
    }
}

pub trait ShardableTest: Send + Sync {
    /// Split into independent pieces. `None` (or a single piece) means the
    /// test does not shard.
    fn split(&self, shard_count: Option<usize>, info: &TestInformation) -> Option<Vec<Arc<dyn RemoteTest>>>;
}

// ---------------------------------------------------------------------------
// Post processors
// ---------------------------------------------------------------------------

/// Derives metrics from a completed run (or test) and the logs associated
/// with it.
pub trait PostProcessor: Send {
    fn name(&self) -> &str;

    fn is_disabled(&self) -> bool {
        false
    }

    fn process_run_metrics_and_logs(&mut self, raw: &RunMetrics, logs: &[(String, LogFile)]) -> RunMetrics;

    fn process_test_metrics_and_logs(
        &mut self,
        _test: &TestDescription,
        _raw: &RunMetrics,
        _logs: &[(String, LogFile)],
    ) -> RunMetrics {
        RunMetrics::new()
    }
}

// ---------------------------------------------------------------------------
// Log saver
// ---------------------------------------------------------------------------

pub trait LogSaver: Send {
    fn invocation_started(&mut self, _context: &InvocationContext) -> Result<()> {
        Ok(())
    }

    /// Persist `data`; each call yields a distinct handle even for a repeated name.
    fn save_log_data(&mut self, name: &str, data_type: LogDataType, data: &LogData) -> Result<LogFile>;

    fn invocation_ended(&mut self, _elapsed: Duration) {}
}
