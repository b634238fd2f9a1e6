//! Buffer-and-replay of result events, keyed by (module, run).
//!
//! Shards report concurrently into one set of listeners. Each shard's
//! events are held in a [`LogAssociationTracker`] and replayed as one
//! ordered block when the shard's invocation ends.

use std::time::Duration;

use invoker_domain::{
    FailureDescription, InvocationContext, LogData, LogDataType, LogFile, ModuleContext,
    ResultSink, RunMetrics, Summary, TestDescription,
};

use crate::forwarder::SharedSink;
use crate::shard::ShardMainForwarder;

/// Module and run an event was reported under; `None` at invocation scope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventScope {
    pub module: Option<String>,
    pub run: Option<String>,
}

#[derive(Debug, Clone)]
enum Buffered {
    ModuleStarted(ModuleContext),
    ModuleEnded,
    RunStarted(String, usize, u32),
    RunFailed(FailureDescription),
    RunEnded(Duration, RunMetrics),
    TestStarted(TestDescription),
    TestFailed(TestDescription, FailureDescription),
    TestEnded(TestDescription, RunMetrics),
    Log(String, LogDataType, LogData),
    LogSaved(String, LogDataType, LogData, LogFile),
    Association(String, LogFile),
}

impl Buffered {
    fn replay(&self, sink: &mut dyn ResultSink) {
        match self {
            Buffered::ModuleStarted(module) => sink.test_module_started(module),
            Buffered::ModuleEnded => sink.test_module_ended(),
            Buffered::RunStarted(name, count, attempt) => sink.test_run_started(name, *count, *attempt),
            Buffered::RunFailed(failure) => sink.test_run_failed(failure),
            Buffered::RunEnded(elapsed, metrics) => sink.test_run_ended(*elapsed, metrics),
            Buffered::TestStarted(test) => sink.test_started(test),
            Buffered::TestFailed(test, failure) => sink.test_failed(test, failure),
            Buffered::TestEnded(test, metrics) => sink.test_ended(test, metrics),
            Buffered::Log(name, data_type, data) => sink.test_log(name, *data_type, data),
            Buffered::LogSaved(name, data_type, data, file) => {
                sink.test_log_saved(name, *data_type, data, file)
            }
            Buffered::Association(name, file) => sink.log_association(name, file),
        }
    }
}

/// Ordered buffer of result events with a one-shot replay.
#[derive(Debug, Default)]
pub struct LogAssociationTracker {
    events: Vec<(EventScope, Buffered)>,
    current: EventScope,
    replayed: bool,
}

impl LogAssociationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, event: Buffered) {
        if self.replayed {
            tracing::debug!("event after replay dropped");
            return;
        }
        self.events.push((self.current.clone(), event));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    /// Names of the log associations recorded under `scope`.
    pub fn associations_in(&self, scope: &EventScope) -> Vec<&str> {
        self.events
            .iter()
            .filter(|(s, _)| s == scope)
            .filter_map(|(_, e)| match e {
                Buffered::Association(name, _) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replay every buffered event to `sink`, in arrival order. Only the
    /// first call replays; later calls return `false`.
    pub fn replay(&mut self, sink: &mut dyn ResultSink) -> bool {
        if self.replayed {
            return false;
        }
        self.replayed = true;
        for (_, event) in std::mem::take(&mut self.events) {
            event.replay(sink);
        }
        true
    }
}

impl ResultSink for LogAssociationTracker {
    fn test_module_started(&mut self, module: &ModuleContext) {
        self.current = EventScope {
            module: Some(module.module_id.clone()),
            run: None,
        };
        self.push(Buffered::ModuleStarted(module.clone()));
    }

    fn test_module_ended(&mut self) {
        self.push(Buffered::ModuleEnded);
        self.current = EventScope::default();
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.current.run = Some(name.to_string());
        self.push(Buffered::RunStarted(name.to_string(), test_count, attempt));
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.push(Buffered::RunFailed(failure.clone()));
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.push(Buffered::RunEnded(elapsed, metrics.clone()));
        self.current.run = None;
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.push(Buffered::TestStarted(test.clone()));
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.push(Buffered::TestFailed(test.clone(), failure.clone()));
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.push(Buffered::TestEnded(test.clone(), metrics.clone()));
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.push(Buffered::Log(name.to_string(), data_type, data.clone()));
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.push(Buffered::LogSaved(
            name.to_string(),
            data_type,
            data.clone(),
            saved.clone(),
        ));
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.push(Buffered::Association(name.to_string(), saved.clone()));
    }
}

// ---------------------------------------------------------------------------
// ShardListener
// ---------------------------------------------------------------------------

/// Listener of one shard: buffers the shard's events and hands them to the
/// shared main forwarder in one block when the shard ends.
pub struct ShardListener {
    tracker: LogAssociationTracker,
    main: SharedSink<ShardMainForwarder>,
    ended: bool,
}

impl ShardListener {
    pub fn new(main: SharedSink<ShardMainForwarder>) -> Self {
        Self {
            tracker: LogAssociationTracker::new(),
            main,
            ended: false,
        }
    }
}

impl ResultSink for ShardListener {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.main.lock().invocation_started(context);
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.main.lock().invocation_failed(failure);
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        if self.ended {
            return;
        }
        self.ended = true;
        let mut main = self.main.lock();
        self.tracker.replay(&mut *main);
        main.invocation_ended(elapsed);
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.tracker.test_module_started(module)
    }

    fn test_module_ended(&mut self) {
        self.tracker.test_module_ended()
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.tracker.test_run_started(name, test_count, attempt)
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.tracker.test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.tracker.test_run_ended(elapsed, metrics)
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.tracker.test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.tracker.test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.tracker.test_ended(test, metrics)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.tracker.test_log(name, data_type, data)
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.tracker.test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.tracker.log_association(name, saved)
    }

    fn summary(&self) -> Option<Summary> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::RecordingSink;
    use std::path::PathBuf;

    fn saved(name: &str) -> LogFile {
        LogFile {
            path: PathBuf::from(name),
            url: None,
            data_type: LogDataType::Text,
            digest: String::new(),
            size: 0,
        }
    }

    #[test]
    fn test_replay_preserves_order_and_is_idempotent() {
        let mut tracker = LogAssociationTracker::new();
        tracker.log_association("before-run", &saved("a"));
        tracker.test_module_started(&ModuleContext::new("module"));
        tracker.test_run_started("run", 1, 0);
        tracker.log_association("in-run", &saved("b"));
        tracker.test_run_ended(Duration::ZERO, &RunMetrics::new());
        tracker.test_module_ended();

        let mut sink = RecordingSink::new("downstream");
        let recording = sink.recording();
        assert!(tracker.replay(&mut sink));
        assert!(!tracker.replay(&mut sink));

        assert_eq!(
            recording.labels(),
            vec![
                "log_association:before-run",
                "module_started:module",
                "run_started:run:0",
                "log_association:in-run",
                "run_ended",
                "module_ended",
            ]
        );
    }

    #[test]
    fn test_events_keyed_by_module_and_run() {
        let mut tracker = LogAssociationTracker::new();
        tracker.log_association("invocation-scope", &saved("a"));
        tracker.test_module_started(&ModuleContext::new("m1"));
        tracker.test_run_started("r1", 0, 0);
        tracker.log_association("run-scope", &saved("b"));
        tracker.test_run_ended(Duration::ZERO, &RunMetrics::new());
        tracker.log_association("module-scope", &saved("c"));

        assert_eq!(
            tracker.associations_in(&EventScope::default()),
            vec!["invocation-scope"]
        );
        assert_eq!(
            tracker.associations_in(&EventScope {
                module: Some("m1".to_string()),
                run: Some("r1".to_string()),
            }),
            vec!["run-scope"]
        );
        assert_eq!(
            tracker.associations_in(&EventScope {
                module: Some("m1".to_string()),
                run: None,
            }),
            vec!["module-scope"]
        );
    }
}
