//! Result sink: the listener contract every reporting backend implements.
//!
//! All callbacks default to no-ops so a sink only overrides what it consumes.
//! Decorators (collectors, post processors, log savers, shard listeners)
//! implement the trait by forwarding to an inner sink.

use std::time::Duration;

use crate::context::InvocationContext;
use crate::failure::FailureDescription;
use crate::result::{
    LogData, LogDataType, LogFile, ModuleContext, RunMetrics, Summary, TestDescription,
};

pub trait ResultSink: Send {
    fn invocation_started(&mut self, _context: &InvocationContext) {}

    fn invocation_failed(&mut self, _failure: &FailureDescription) {}

    fn invocation_ended(&mut self, _elapsed: Duration) {}

    fn test_module_started(&mut self, _module: &ModuleContext) {}

    fn test_module_ended(&mut self) {}

    /// `attempt` starts at 0 and grows with every retry of the same run.
    fn test_run_started(&mut self, _name: &str, _test_count: usize, _attempt: u32) {}

    fn test_run_failed(&mut self, _failure: &FailureDescription) {}

    fn test_run_ended(&mut self, _elapsed: Duration, _metrics: &RunMetrics) {}

    fn test_started(&mut self, _test: &TestDescription) {}

    fn test_failed(&mut self, _test: &TestDescription, _failure: &FailureDescription) {}

    fn test_ended(&mut self, _test: &TestDescription, _metrics: &RunMetrics) {}

    fn test_log(&mut self, _name: &str, _data_type: LogDataType, _data: &LogData) {}

    fn test_log_saved(
        &mut self,
        _name: &str,
        _data_type: LogDataType,
        _data: &LogData,
        _saved: &LogFile,
    ) {
    }

    fn log_association(&mut self, _name: &str, _saved: &LogFile) {}

    fn summary(&self) -> Option<Summary> {
        None
    }

    /// Summaries of this sink and, for forwarders, of every sink behind it.
    fn summaries(&self) -> Vec<Summary> {
        self.summary().into_iter().collect()
    }

    /// Sinks that return `false` want retried runs merged into one.
    fn supports_granular_results(&self) -> bool {
        true
    }
}

macro_rules! forward_sink {
    () => {
        fn invocation_started(&mut self, context: &InvocationContext) {
            (**self).invocation_started(context)
        }
        fn invocation_failed(&mut self, failure: &FailureDescription) {
            (**self).invocation_failed(failure)
        }
        fn invocation_ended(&mut self, elapsed: Duration) {
            (**self).invocation_ended(elapsed)
        }
        fn test_module_started(&mut self, module: &ModuleContext) {
            (**self).test_module_started(module)
        }
        fn test_module_ended(&mut self) {
            (**self).test_module_ended()
        }
        fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
            (**self).test_run_started(name, test_count, attempt)
        }
        fn test_run_failed(&mut self, failure: &FailureDescription) {
            (**self).test_run_failed(failure)
        }
        fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
            (**self).test_run_ended(elapsed, metrics)
        }
        fn test_started(&mut self, test: &TestDescription) {
            (**self).test_started(test)
        }
        fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
            (**self).test_failed(test, failure)
        }
        fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
            (**self).test_ended(test, metrics)
        }
        fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
            (**self).test_log(name, data_type, data)
        }
        fn test_log_saved(
            &mut self,
            name: &str,
            data_type: LogDataType,
            data: &LogData,
            saved: &LogFile,
        ) {
            (**self).test_log_saved(name, data_type, data, saved)
        }
        fn log_association(&mut self, name: &str, saved: &LogFile) {
            (**self).log_association(name, saved)
        }
        fn summary(&self) -> Option<Summary> {
            (**self).summary()
        }
        fn summaries(&self) -> Vec<Summary> {
            (**self).summaries()
        }
        fn supports_granular_results(&self) -> bool {
            (**self).supports_granular_results()
        }
    };
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    forward_sink!();
}

impl<S: ResultSink + ?Sized> ResultSink for Box<S> {
    forward_sink!();
}
