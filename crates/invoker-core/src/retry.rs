//! Test retries and merging of retried runs.
//!
//! [`RetryCoordinator`] re-runs one test under the configured strategy.
//! Every attempt is a separate run (same name, growing attempt index) so
//! granular listeners see each of them. [`ResultAggregator`] folds the
//! attempts of a run into one for listeners that asked for merged results.

use std::time::Duration;

use invoker_domain::{
    CollectorSet, FailureDescription, InvocationContext, LogData, LogDataType, LogFile,
    ModuleContext, RemoteTest, Result, ResultSink, RunMetrics, Summary, TestDescription,
    TestRunInput,
};

use crate::collector::MetricCollectorChain;
use crate::config::{RetryConfig, RetryStrategy};
use crate::metrics::InvocationMetrics;
use crate::obs;

// ---------------------------------------------------------------------------
// AttemptSink
// ---------------------------------------------------------------------------

/// Forwards one attempt's events and remembers whether it saw a failure.
pub struct AttemptSink<S> {
    inner: S,
    test_failures: usize,
    run_failed: bool,
}

impl<S: ResultSink> AttemptSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            test_failures: 0,
            run_failed: false,
        }
    }

    pub fn has_failure(&self) -> bool {
        self.test_failures > 0 || self.run_failed
    }

    pub fn test_failures(&self) -> usize {
        self.test_failures
    }
}

impl<S: ResultSink> ResultSink for AttemptSink<S> {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.inner.invocation_started(context)
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.inner.invocation_failed(failure)
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.inner.invocation_ended(elapsed)
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
        self.run_failed = true;
        self.inner.test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.inner.test_run_ended(elapsed, metrics)
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.inner.test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.test_failures += 1;
        self.inner.test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.inner.test_ended(test, metrics)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.inner.test_log(name, data_type, data)
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.inner.test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.inner.log_association(name, saved)
    }

    fn summaries(&self) -> Vec<Summary> {
        self.inner.summaries()
    }

    fn supports_granular_results(&self) -> bool {
        self.inner.supports_granular_results()
    }
}

// ---------------------------------------------------------------------------
// RetryCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStatistics {
    pub attempts: u32,
    pub failed_attempts: u32,
    pub last_attempt_failed: bool,
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        if self.config.auto_retry && self.config.strategy != RetryStrategy::NoRetry {
            self.config.max_testcase_run_count.max(1)
        } else {
            1
        }
    }

    /// Whether another attempt follows attempt `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32, had_failure: bool) -> bool {
        if attempt + 1 >= self.max_attempts() {
            return false;
        }
        match self.config.strategy {
            RetryStrategy::NoRetry => false,
            RetryStrategy::Iterations => true,
            RetryStrategy::RetryAnyFailure => had_failure,
            RetryStrategy::RerunUntilFailure => !had_failure,
        }
    }

    /// Run `test` until the strategy says stop.
    ///
    /// Each attempt is wrapped in its own collector chain. Collector-aware
    /// tests receive the set through their input and are left unwrapped. An
    /// error returned by the test ends the loop and is not retried.
    pub async fn run<S: ResultSink>(
        &self,
        test: &dyn RemoteTest,
        input: &TestRunInput<'_>,
        collectors: &CollectorSet,
        sink: &mut S,
        metrics: &InvocationMetrics,
    ) -> Result<RetryStatistics> {
        let unwrapped = CollectorSet::default();
        let chain_set = if test.capabilities().collector_aware {
            &unwrapped
        } else {
            collectors
        };

        let mut stats = RetryStatistics::default();
        let mut attempt = 0;
        loop {
            let mut attempt_sink = AttemptSink::new(MetricCollectorChain::wrap(chain_set, &mut *sink));
            metrics.inc_test_attempts();
            test.run(&input.with_attempt(attempt), &mut attempt_sink).await?;

            let failed = attempt_sink.has_failure();
            obs::emit_attempt_finished(test.name(), attempt, failed);
            stats.attempts += 1;
            stats.last_attempt_failed = failed;
            if failed {
                stats.failed_attempts += 1;
            }
            if !self.should_retry(attempt, failed) {
                return Ok(stats);
            }
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// ResultAggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum LogEvent {
    Log(String, LogDataType, LogData),
    Saved(String, LogDataType, LogData, LogFile),
    Association(String, LogFile),
}

impl LogEvent {
    fn replay(&self, sink: &mut dyn ResultSink) {
        match self {
            LogEvent::Log(name, data_type, data) => sink.test_log(name, *data_type, data),
            LogEvent::Saved(name, data_type, data, file) => {
                sink.test_log_saved(name, *data_type, data, file)
            }
            LogEvent::Association(name, file) => sink.log_association(name, file),
        }
    }
}

#[derive(Debug, Clone)]
struct MergedTest {
    test: TestDescription,
    failure: Option<FailureDescription>,
    metrics: RunMetrics,
    logs: Vec<LogEvent>,
}

/// All attempts of one run seen so far.
#[derive(Debug)]
struct PendingRun {
    name: String,
    test_count: usize,
    tests: Vec<MergedTest>,
    current_test: Option<usize>,
    run_failures: Vec<FailureDescription>,
    last_attempt_failed: bool,
    logs: Vec<LogEvent>,
    metrics: RunMetrics,
    elapsed: Duration,
    open: bool,
}

impl PendingRun {
    fn new(name: &str, test_count: usize) -> Self {
        Self {
            name: name.to_string(),
            test_count,
            tests: Vec::new(),
            current_test: None,
            run_failures: Vec::new(),
            last_attempt_failed: false,
            logs: Vec::new(),
            metrics: RunMetrics::new(),
            elapsed: Duration::ZERO,
            open: true,
        }
    }

    fn start_attempt(&mut self, test_count: usize) {
        self.test_count = self.test_count.max(test_count);
        self.last_attempt_failed = false;
        self.current_test = None;
        self.open = true;
    }

    fn start_test(&mut self, test: &TestDescription) {
        let index = match self.tests.iter().position(|t| &t.test == test) {
            Some(index) => {
                self.tests[index].failure = None;
                index
            }
            None => {
                self.tests.push(MergedTest {
                    test: test.clone(),
                    failure: None,
                    metrics: RunMetrics::new(),
                    logs: Vec::new(),
                });
                self.tests.len() - 1
            }
        };
        self.current_test = Some(index);
    }

    fn push_log(&mut self, event: LogEvent) {
        match self.current_test {
            Some(index) => self.tests[index].logs.push(event),
            None => self.logs.push(event),
        }
    }

    fn replay(&self, sink: &mut dyn ResultSink) {
        sink.test_run_started(&self.name, self.test_count, 0);
        for merged in &self.tests {
            sink.test_started(&merged.test);
            for log in &merged.logs {
                log.replay(sink);
            }
            if let Some(failure) = &merged.failure {
                sink.test_failed(&merged.test, failure);
            }
            sink.test_ended(&merged.test, &merged.metrics);
        }
        for log in &self.logs {
            log.replay(sink);
        }
        if self.last_attempt_failed {
            if let Some(failure) = FailureDescription::join(self.run_failures.clone()) {
                sink.test_run_failed(&failure);
            }
        }
        sink.test_run_ended(self.elapsed, &self.metrics);
    }
}

/// Routes events to granular listeners as they come and to the other
/// listeners as one merged run per run name.
///
/// A merged run is flushed when a run with another name starts, at module
/// boundaries and at `invocation_ended`. Invocation-scope log associations
/// arriving while a merged run is pending are held back until it is flushed.
pub struct ResultAggregator {
    granular: Vec<Box<dyn ResultSink>>,
    aggregated: Vec<Box<dyn ResultSink>>,
    pending: Option<PendingRun>,
    deferred: Vec<LogEvent>,
}

impl ResultAggregator {
    pub fn new(listeners: Vec<Box<dyn ResultSink>>) -> Self {
        let (granular, aggregated) = listeners
            .into_iter()
            .partition(|l| l.supports_granular_results());
        Self {
            granular,
            aggregated,
            pending: None,
            deferred: Vec::new(),
        }
    }

    /// Whether any listener asked for merged results.
    pub fn needs_aggregation(listeners: &[Box<dyn ResultSink>]) -> bool {
        listeners.iter().any(|l| !l.supports_granular_results())
    }

    fn granular(&mut self, mut f: impl FnMut(&mut dyn ResultSink)) {
        for listener in &mut self.granular {
            f(listener.as_mut());
        }
    }

    fn aggregated(&mut self, mut f: impl FnMut(&mut dyn ResultSink)) {
        for listener in &mut self.aggregated {
            f(listener.as_mut());
        }
    }

    fn all(&mut self, mut f: impl FnMut(&mut dyn ResultSink)) {
        self.granular(&mut f);
        self.aggregated(&mut f);
    }

    fn flush(&mut self) {
        if let Some(run) = self.pending.take() {
            tracing::debug!(run = %run.name, "flushing merged run");
            for listener in &mut self.aggregated {
                run.replay(listener.as_mut());
            }
        }
        for event in std::mem::take(&mut self.deferred) {
            for listener in &mut self.aggregated {
                event.replay(listener.as_mut());
            }
        }
    }

    fn log_event(&mut self, event: LogEvent) {
        match &mut self.pending {
            Some(run) if run.open => run.push_log(event),
            Some(_) => self.deferred.push(event),
            None => {
                for listener in &mut self.aggregated {
                    event.replay(listener.as_mut());
                }
            }
        }
    }
}

impl ResultSink for ResultAggregator {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.all(|l| l.invocation_started(context));
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.all(|l| l.invocation_failed(failure));
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.flush();
        self.all(|l| l.invocation_ended(elapsed));
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.flush();
        self.all(|l| l.test_module_started(module));
    }

    fn test_module_ended(&mut self) {
        self.flush();
        self.all(|l| l.test_module_ended());
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.granular(|l| l.test_run_started(name, test_count, attempt));
        match self.pending.as_mut().filter(|run| run.name == name) {
            Some(run) => run.start_attempt(test_count),
            None => {
                self.flush();
                self.pending = Some(PendingRun::new(name, test_count));
            }
        }
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.granular(|l| l.test_run_failed(failure));
        match &mut self.pending {
            Some(run) => {
                run.run_failures.push(failure.clone());
                run.last_attempt_failed = true;
            }
            None => self.aggregated(|l| l.test_run_failed(failure)),
        }
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.granular(|l| l.test_run_ended(elapsed, metrics));
        match &mut self.pending {
            Some(run) => {
                run.elapsed += elapsed;
                run.metrics = metrics.clone();
                run.current_test = None;
                run.open = false;
            }
            None => self.aggregated(|l| l.test_run_ended(elapsed, metrics)),
        }
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.granular(|l| l.test_started(test));
        match &mut self.pending {
            Some(run) => run.start_test(test),
            None => self.aggregated(|l| l.test_started(test)),
        }
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.granular(|l| l.test_failed(test, failure));
        match &mut self.pending {
            Some(run) => {
                if let Some(merged) = run.tests.iter_mut().find(|t| &t.test == test) {
                    merged.failure = Some(failure.clone());
                }
            }
            None => self.aggregated(|l| l.test_failed(test, failure)),
        }
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.granular(|l| l.test_ended(test, metrics));
        match &mut self.pending {
            Some(run) => {
                if let Some(merged) = run.tests.iter_mut().find(|t| &t.test == test) {
                    merged.metrics = metrics.clone();
                }
                run.current_test = None;
            }
            None => self.aggregated(|l| l.test_ended(test, metrics)),
        }
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.granular(|l| l.test_log(name, data_type, data));
        self.log_event(LogEvent::Log(name.to_string(), data_type, data.clone()));
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.granular(|l| l.test_log_saved(name, data_type, data, saved));
        self.log_event(LogEvent::Saved(
            name.to_string(),
            data_type,
            data.clone(),
            saved.clone(),
        ));
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.granular(|l| l.log_association(name, saved));
        self.log_event(LogEvent::Association(name.to_string(), saved.clone()));
    }

    fn summaries(&self) -> Vec<Summary> {
        self.granular
            .iter()
            .chain(self.aggregated.iter())
            .flat_map(|l| l.summaries())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::{CallLog, RecordingSink, SinkEvent, StubTest, TestOutcome};
    use invoker_domain::{FailureStatus, TestInformation};
    use std::path::PathBuf;

    fn coordinator(strategy: RetryStrategy, count: u32) -> RetryCoordinator {
        RetryCoordinator::new(RetryConfig {
            auto_retry: true,
            max_testcase_run_count: count,
            strategy,
        })
    }

    #[test]
    fn test_max_attempts_requires_auto_retry() {
        assert_eq!(coordinator(RetryStrategy::Iterations, 3).max_attempts(), 3);
        assert_eq!(coordinator(RetryStrategy::Iterations, 0).max_attempts(), 1);
        assert_eq!(coordinator(RetryStrategy::NoRetry, 3).max_attempts(), 1);
        let off = RetryCoordinator::new(RetryConfig {
            auto_retry: false,
            max_testcase_run_count: 3,
            strategy: RetryStrategy::Iterations,
        });
        assert_eq!(off.max_attempts(), 1);
    }

    #[test]
    fn test_should_retry_per_strategy() {
        let any = coordinator(RetryStrategy::RetryAnyFailure, 3);
        assert!(any.should_retry(0, true));
        assert!(!any.should_retry(0, false));
        assert!(!any.should_retry(2, true));

        let until = coordinator(RetryStrategy::RerunUntilFailure, 3);
        assert!(until.should_retry(1, false));
        assert!(!until.should_retry(1, true));
    }

    #[tokio::test]
    async fn test_iterations_run_every_attempt() {
        let info = TestInformation::new(InvocationContext::new("stub")).expect("info");
        let test = StubTest::new("suite", CallLog::new()).with_case("ok", TestOutcome::Pass);
        let mut sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let metrics = InvocationMetrics::new();

        let stats = coordinator(RetryStrategy::Iterations, 3)
            .run(&test, &TestRunInput::new(&info), &CollectorSet::default(), &mut sink, &metrics)
            .await
            .expect("run");

        assert_eq!(stats.attempts, 3);
        let attempts: Vec<u32> = recording.run_starts().into_iter().map(|(_, _, a)| a).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert_eq!(metrics.test_attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_any_failure_stops_on_success() {
        let info = TestInformation::new(InvocationContext::new("stub")).expect("info");
        let test = StubTest::new("suite", CallLog::new())
            .with_case("flaky", TestOutcome::Pass)
            .failing_first(1);
        let mut sink = RecordingSink::new("terminal");
        let metrics = InvocationMetrics::new();

        let stats = coordinator(RetryStrategy::RetryAnyFailure, 5)
            .run(&test, &TestRunInput::new(&info), &CollectorSet::default(), &mut sink, &metrics)
            .await
            .expect("run");

        assert_eq!(
            stats,
            RetryStatistics {
                attempts: 2,
                failed_attempts: 1,
                last_attempt_failed: false,
            }
        );
    }

    #[tokio::test]
    async fn test_error_aborts_retries() {
        let info = TestInformation::new(InvocationContext::new("stub")).expect("info");
        let test = StubTest::new("suite", CallLog::new())
            .failing_with(invoker_domain::InvocationError::FatalHost("no disk".to_string()));
        let mut sink = RecordingSink::new("terminal");

        let result = coordinator(RetryStrategy::Iterations, 4)
            .run(
                &test,
                &TestRunInput::new(&info),
                &CollectorSet::default(),
                &mut sink,
                &InvocationMetrics::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(test.run_count(), 1);
    }

    fn saved(name: &str) -> LogFile {
        LogFile {
            path: PathBuf::from(name),
            url: None,
            data_type: LogDataType::Text,
            digest: String::new(),
            size: 0,
        }
    }

    fn attempt(agg: &mut ResultAggregator, index: u32, fail: bool) {
        let test = TestDescription::new("Suite", "flaky");
        agg.test_run_started("run", 1, index);
        agg.test_started(&test);
        if fail {
            agg.test_failed(
                &test,
                &FailureDescription::new(format!("failed {index}"))
                    .with_status(FailureStatus::TestFailure),
            );
        }
        agg.log_association(&format!("log-{index}"), &saved(&format!("log-{index}")));
        agg.test_ended(&test, &RunMetrics::new());
        if fail {
            agg.test_run_failed(&FailureDescription::new(format!("run failed {index}")));
        }
        agg.test_run_ended(Duration::from_millis(10), &RunMetrics::new());
    }

    #[test]
    fn test_aggregator_merges_attempts_for_non_granular_listener() {
        let granular = RecordingSink::new("granular");
        let merged = RecordingSink::new("merged").aggregated();
        let (g, m) = (granular.recording(), merged.recording());
        let mut agg = ResultAggregator::new(vec![Box::new(granular), Box::new(merged)]);

        attempt(&mut agg, 0, true);
        attempt(&mut agg, 1, false);
        agg.log_association("host_log", &saved("host_log"));
        agg.invocation_ended(Duration::ZERO);

        assert_eq!(g.run_starts().len(), 2);
        assert_eq!(
            m.labels(),
            vec![
                "run_started:run:0",
                "test_started:flaky",
                "log_association:log-0",
                "log_association:log-1",
                "test_ended:flaky",
                "run_ended",
                "log_association:host_log",
                "invocation_ended",
            ]
        );
    }

    #[test]
    fn test_aggregator_joins_run_failures_when_last_attempt_failed() {
        let merged = RecordingSink::new("merged").aggregated();
        let m = merged.recording();
        let mut agg = ResultAggregator::new(vec![Box::new(merged)]);

        attempt(&mut agg, 0, true);
        attempt(&mut agg, 1, true);
        agg.test_run_started("other", 0, 0);
        agg.test_run_ended(Duration::ZERO, &RunMetrics::new());
        agg.invocation_ended(Duration::ZERO);

        let run_failures: Vec<FailureDescription> = m
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::RunFailed(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(run_failures.len(), 1);
        assert!(run_failures[0].is_multi());
        assert_eq!(
            m.count(|e| matches!(e, SinkEvent::TestFailed(_, msg) if msg == "failed 1")),
            1
        );
        let names: Vec<String> = m.run_starts().into_iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["run", "other"]);
    }
}
