//! Domain model for test invocations.
//!
//! This crate defines what an invocation works with:
//! - `InvocationContext`, `BuildRecord`, `TestInformation`: identity and per-attempt state
//! - `FailureDescription`, `InvocationError`: the failure taxonomy
//! - `ResultSink`: the listener contract reporting backends implement
//! - Collaborator traits (build providers, preparers, tests, collectors,
//!   post processors, log savers) and in-memory fakes for them

pub mod build;
pub mod collector;
pub mod context;
pub mod device;
pub mod error;
pub mod failure;
pub mod fakes;
pub mod result;
pub mod sink;
pub mod test_info;
pub mod traits;

pub use build::{BuildFile, BuildRecord, COMMAND_ARGS_KEY, UNKNOWN_BUILD_ID};
pub use collector::{CollectorHandle, CollectorSet, DeviceMetricData, MetricCollector};
pub use context::{Attributes, DeviceSlot, InvocationContext, ShardDescriptor, DEFAULT_SLOT};
pub use device::{Device, DeviceState, RecoveryMode};
pub use error::{InvocationError, Result};
pub use failure::{ActionInProgress, FailureDescription, FailureStatus};
pub use result::{
    DataType, LogData, LogDataType, LogFile, Measurement, Metric, ModuleContext, RunMetrics,
    Summary, TestDescription,
};
pub use sink::ResultSink;
pub use test_info::{ScratchMap, TestInformation};
pub use traits::{
    BuildProvider, BuildRequest, CapturedLog, LogSaver, LogSource, PostProcessor, Preparer,
    RemoteTest, ShardableTest, TestCapabilities, TestRunInput,
};
