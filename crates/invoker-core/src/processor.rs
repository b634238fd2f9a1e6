//! Post processor chain: derives summary metrics from completed runs.

use std::time::Duration;

use invoker_domain::{
    FailureDescription, InvocationContext, LogData, LogDataType, LogFile, ModuleContext,
    PostProcessor, ResultSink, RunMetrics, Summary, TestDescription,
};

struct ProcessorListener {
    processor: Box<dyn PostProcessor>,
    run_logs: Vec<(String, LogFile)>,
    test_logs: Vec<(String, LogFile)>,
}

/// Records the logs associated with each run and test; at `test_ended` and
/// `test_run_ended` every processor derives metrics that are appended, as
/// processed metrics, after the raw ones.
///
/// Like collectors, processors wrap in registration order: the last
/// registered one runs first and its keys come first.
pub struct PostProcessorChain<S> {
    /// Outermost first.
    listeners: Vec<ProcessorListener>,
    inner: S,
    in_test: bool,
}

impl<S: ResultSink> PostProcessorChain<S> {
    /// Disabled processors are left out.
    pub fn wrap(processors: Vec<Box<dyn PostProcessor>>, inner: S) -> Self {
        let listeners = processors
            .into_iter()
            .filter(|p| {
                if p.is_disabled() {
                    tracing::debug!(processor = %p.name(), "skipping disabled post processor");
                    false
                } else {
                    true
                }
            })
            .rev()
            .map(|processor| ProcessorListener {
                processor,
                run_logs: Vec::new(),
                test_logs: Vec::new(),
            })
            .collect();
        Self {
            listeners,
            inner,
            in_test: false,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.processor.name()).collect()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

fn append_processed(target: &mut RunMetrics, derived: RunMetrics) {
    for (key, metric) in derived.iter() {
        target.insert(key, metric.clone().processed());
    }
}

impl<S: ResultSink> ResultSink for PostProcessorChain<S> {
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
        for listener in &mut self.listeners {
            listener.run_logs.clear();
        }
        self.inner.test_run_started(name, test_count, attempt)
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.inner.test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        let mut out = metrics.clone();
        for listener in &mut self.listeners {
            let derived = listener
                .processor
                .process_run_metrics_and_logs(metrics, &listener.run_logs);
            append_processed(&mut out, derived);
        }
        self.inner.test_run_ended(elapsed, &out)
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.in_test = true;
        for listener in &mut self.listeners {
            listener.test_logs.clear();
        }
        self.inner.test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.inner.test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.in_test = false;
        let mut out = metrics.clone();
        for listener in &mut self.listeners {
            let derived =
                listener
                    .processor
                    .process_test_metrics_and_logs(test, metrics, &listener.test_logs);
            append_processed(&mut out, derived);
        }
        self.inner.test_ended(test, &out)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.inner.test_log(name, data_type, data)
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.inner.test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        for listener in &mut self.listeners {
            listener.run_logs.push((name.to_string(), saved.clone()));
            if self.in_test {
                listener.test_logs.push((name.to_string(), saved.clone()));
            }
        }
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
