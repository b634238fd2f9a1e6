//! Listener fan-out and the shared/log-saving layers of the sink stack.
//!
//! The executor assembles, from the outside in:
//!
//! ```text
//! LogSaverForwarder -> PostProcessorChain -> SharedSink -> ResultForwarder | ResultAggregator
//! ```
//!
//! Metric collectors are wrapped around that stack per test attempt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use invoker_domain::{
    FailureDescription, InvocationContext, LogData, LogDataType, LogFile, LogSaver, ModuleContext,
    ResultSink, RunMetrics, Summary, TestDescription,
};

use crate::metrics::InvocationMetrics;

// ---------------------------------------------------------------------------
// ResultForwarder
// ---------------------------------------------------------------------------

/// Forwards every callback to each listener, in registration order.
#[derive(Default)]
pub struct ResultForwarder {
    listeners: Vec<Box<dyn ResultSink>>,
}

impl ResultForwarder {
    pub fn new(listeners: Vec<Box<dyn ResultSink>>) -> Self {
        Self { listeners }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&mut self, mut f: impl FnMut(&mut dyn ResultSink)) {
        for listener in &mut self.listeners {
            f(listener.as_mut());
        }
    }
}

impl ResultSink for ResultForwarder {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.each(|l| l.invocation_started(context));
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.each(|l| l.invocation_failed(failure));
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.each(|l| l.invocation_ended(elapsed));
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.each(|l| l.test_module_started(module));
    }

    fn test_module_ended(&mut self) {
        self.each(|l| l.test_module_ended());
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.each(|l| l.test_run_started(name, test_count, attempt));
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.each(|l| l.test_run_failed(failure));
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.each(|l| l.test_run_ended(elapsed, metrics));
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.each(|l| l.test_started(test));
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.each(|l| l.test_failed(test, failure));
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.each(|l| l.test_ended(test, metrics));
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.each(|l| l.test_log(name, data_type, data));
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.each(|l| l.test_log_saved(name, data_type, data, saved));
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.each(|l| l.log_association(name, saved));
    }

    fn summaries(&self) -> Vec<Summary> {
        self.listeners.iter().flat_map(|l| l.summaries()).collect()
    }
}

// ---------------------------------------------------------------------------
// SharedSink
// ---------------------------------------------------------------------------

/// A sink behind `Arc<Mutex<_>>`, usable from several layers or shards.
///
/// The lock is held for one callback only. A poisoned lock is recovered
/// since a panicking listener must not silence every other report.
pub struct SharedSink<S: ResultSink + ?Sized = dyn ResultSink> {
    inner: Arc<Mutex<S>>,
}

impl<S: ResultSink + ?Sized> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ResultSink> SharedSink<S> {
    pub fn new(sink: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }
}

impl<S: ResultSink + 'static> SharedSink<S> {
    /// Forget the concrete type.
    pub fn erase(self) -> SharedSink {
        let inner: Arc<Mutex<dyn ResultSink>> = self.inner;
        SharedSink { inner }
    }
}

impl<S: ResultSink + ?Sized> SharedSink<S> {
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: ResultSink + ?Sized> ResultSink for SharedSink<S> {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.lock().invocation_started(context)
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.lock().invocation_failed(failure)
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.lock().invocation_ended(elapsed)
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.lock().test_module_started(module)
    }

    fn test_module_ended(&mut self) {
        self.lock().test_module_ended()
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.lock().test_run_started(name, test_count, attempt)
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.lock().test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.lock().test_run_ended(elapsed, metrics)
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.lock().test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.lock().test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.lock().test_ended(test, metrics)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.lock().test_log(name, data_type, data)
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.lock().test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.lock().log_association(name, saved)
    }

    fn summary(&self) -> Option<Summary> {
        self.lock().summary()
    }

    fn summaries(&self) -> Vec<Summary> {
        self.lock().summaries()
    }

    fn supports_granular_results(&self) -> bool {
        self.lock().supports_granular_results()
    }
}

// ---------------------------------------------------------------------------
// LogSaverForwarder
// ---------------------------------------------------------------------------

/// Persists every `test_log` and announces the saved handle downstream.
///
/// The raw `test_log` is forwarded first, then `test_log_saved` and
/// `log_association` for the saved file. A save error is logged and the
/// log is only reported raw.
pub struct LogSaverForwarder<S> {
    saver: Box<dyn LogSaver>,
    inner: S,
    metrics: Option<Arc<InvocationMetrics>>,
}

impl<S: ResultSink> LogSaverForwarder<S> {
    pub fn new(saver: Box<dyn LogSaver>, inner: S) -> Self {
        Self {
            saver,
            inner,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<InvocationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// End the saver only. A sharded parent's listeners are ended by the
    /// shard merger instead.
    pub fn finish_saver(&mut self, elapsed: Duration) {
        self.saver.invocation_ended(elapsed);
    }

    /// Save `data` without reporting it as a test log.
    pub fn save(&mut self, name: &str, data_type: LogDataType, data: &LogData) -> Option<LogFile> {
        match self.saver.save_log_data(name, data_type, data) {
            Ok(file) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_logs_saved();
                }
                Some(file)
            }
            Err(err) => {
                tracing::warn!(log = %name, error = %err, "failed to save log");
                None
            }
        }
    }
}

impl<S: ResultSink> ResultSink for LogSaverForwarder<S> {
    fn invocation_started(&mut self, context: &InvocationContext) {
        if let Err(err) = self.saver.invocation_started(context) {
            tracing::warn!(error = %err, "log saver failed to start");
        }
        self.inner.invocation_started(context)
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.inner.invocation_failed(failure)
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.inner.invocation_ended(elapsed);
        self.saver.invocation_ended(elapsed);
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.inner.test_module_started(module)
    }

    fn test_module_ended(&mut self) {
        self.inner.test_module_ended()
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.inner.test_run_started(name, test_count, attempt)
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.inner.test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.inner.test_run_ended(elapsed, metrics)
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.inner.test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.inner.test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.inner.test_ended(test, metrics)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.inner.test_log(name, data_type, data);
        if let Some(file) = self.save(name, data_type, data) {
            self.inner.test_log_saved(name, data_type, data, &file);
            self.inner.log_association(name, &file);
        }
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.inner.test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.inner.log_association(name, saved)
    }

    fn summary(&self) -> Option<Summary> {
        self.inner.summary()
    }

    fn summaries(&self) -> Vec<Summary> {
        self.inner.summaries()
    }

    fn supports_granular_results(&self) -> bool {
        self.inner.supports_granular_results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::{MemoryLogSaver, RecordingSink};

    #[test]
    fn test_forwarder_fans_out_in_order_and_collects_summaries() {
        let first = RecordingSink::new("first");
        let second = RecordingSink::new("second");
        let (r1, r2) = (first.recording(), second.recording());
        let mut forwarder = ResultForwarder::new(vec![Box::new(first), Box::new(second)]);

        forwarder.test_run_started("run", 1, 0);
        forwarder.test_run_ended(Duration::ZERO, &RunMetrics::new());

        assert_eq!(r1.labels(), vec!["run_started:run:0", "run_ended"]);
        assert_eq!(r1.labels(), r2.labels());
        let reporters: Vec<_> = forwarder.summaries().into_iter().map(|s| s.reporter).collect();
        assert_eq!(reporters, vec!["first", "second"]);
    }

    #[test]
    fn test_shared_sink_clones_reach_same_listener() {
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let shared = SharedSink::new(sink).erase();
        let mut a = shared.clone();
        let mut b = shared;

        a.test_module_started(&ModuleContext::new("module"));
        b.test_module_ended();

        assert_eq!(recording.labels(), vec!["module_started:module", "module_ended"]);
    }

    #[test]
    fn test_log_saver_forwarder_saves_and_associates() {
        let saver = MemoryLogSaver::new();
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let metrics = Arc::new(InvocationMetrics::new());
        let mut forwarder =
            LogSaverForwarder::new(Box::new(saver.clone()), sink).with_metrics(metrics.clone());

        forwarder.test_log("logcat", LogDataType::Logcat, &LogData::from("boot"));
        forwarder.test_log("logcat", LogDataType::Logcat, &LogData::from("boot"));

        assert_eq!(
            recording.labels(),
            vec![
                "test_log:logcat",
                "test_log_saved:logcat",
                "log_association:logcat",
                "test_log:logcat",
                "test_log_saved:logcat",
                "log_association:logcat",
            ]
        );
        let saved = saver.saved();
        assert_eq!(saved.len(), 2);
        assert_ne!(saved[0].1.path, saved[1].1.path);
        assert!(metrics
            .snapshot()
            .contains(&("logs_saved".to_string(), "2".to_string())));
    }
}
