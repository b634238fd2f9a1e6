//! Metric collector chain and the built-in auto collectors.
//!
//! Collectors wrap the sink in registration order, so the last registered
//! collector sits outermost and sees every event first. With collectors
//! `[c1, c2, c3, c4]` each writing one key, run metrics come out as
//! `[c4, c3, c2, c1]`.

use std::sync::Arc;
use std::time::Duration;

use invoker_domain::{
    CollectorHandle, CollectorSet, Device, DeviceMetricData, FailureDescription,
    InvocationContext, LogData, LogDataType, LogFile, MetricCollector, ModuleContext, Result,
    ResultSink, RunMetrics, Summary, TestDescription,
};

use crate::config::AutoCollector;

struct CollectorListener {
    handle: CollectorHandle,
    run_data: DeviceMetricData,
    test_data: DeviceMetricData,
}

/// A sink forwarding through every collector of a [`CollectorSet`].
pub struct MetricCollectorChain<S> {
    /// Outermost first.
    listeners: Vec<CollectorListener>,
    inner: S,
}

impl<S: ResultSink> MetricCollectorChain<S> {
    /// Wrap `inner` with every collector of `set`, in registration order.
    pub fn wrap(set: &CollectorSet, inner: S) -> Self {
        let listeners = set
            .handles()
            .iter()
            .rev()
            .map(|handle| CollectorListener {
                handle: handle.clone(),
                run_data: DeviceMetricData::default(),
                test_data: DeviceMetricData::default(),
            })
            .collect();
        Self { listeners, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn emit_logs(inner: &mut S, data: &mut DeviceMetricData) {
        for (name, data_type, log) in std::mem::take(&mut data.logs) {
            inner.test_log(&name, data_type, &log);
        }
    }
}

impl<S: ResultSink> ResultSink for MetricCollectorChain<S> {
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
            listener.run_data = DeviceMetricData::default();
            let data = &mut listener.run_data;
            listener.handle.with(|c| c.on_test_run_start(data, test_count));
        }
        self.inner.test_run_started(name, test_count, attempt);
        for listener in &mut self.listeners {
            Self::emit_logs(&mut self.inner, &mut listener.run_data);
        }
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.inner.test_run_failed(failure)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        let mut current = metrics.clone();
        for listener in &mut self.listeners {
            let data = &mut listener.run_data;
            listener.handle.with(|c| c.on_test_run_end(data, &current));
            current.extend(std::mem::take(&mut data.metrics));
            Self::emit_logs(&mut self.inner, data);
        }
        self.inner.test_run_ended(elapsed, &current)
    }

    fn test_started(&mut self, test: &TestDescription) {
        for listener in &mut self.listeners {
            listener.test_data = DeviceMetricData::default();
            let data = &mut listener.test_data;
            listener.handle.with(|c| c.on_test_start(data));
        }
        self.inner.test_started(test)
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        for listener in &mut self.listeners {
            let data = &mut listener.test_data;
            listener.handle.with(|c| c.on_test_fail(data, test));
        }
        self.inner.test_failed(test, failure)
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        let mut current = metrics.clone();
        for listener in &mut self.listeners {
            let data = &mut listener.test_data;
            listener.handle.with(|c| c.on_test_end(data, &current));
            current.extend(std::mem::take(&mut data.metrics));
            Self::emit_logs(&mut self.inner, data);
        }
        self.inner.test_ended(test, &current)
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

// ---------------------------------------------------------------------------
// Auto collectors
// ---------------------------------------------------------------------------

impl AutoCollector {
    pub fn instantiate(self) -> Box<dyn MetricCollector> {
        match self {
            AutoCollector::ScreenshotOnFailure => Box::new(ScreenshotOnFailure::default()),
            AutoCollector::LogcatOnFailure => Box::new(LogcatOnFailure::default()),
        }
    }
}

/// Append the requested auto collectors after the explicit ones.
pub fn with_auto_collectors(
    mut collectors: Vec<Box<dyn MetricCollector>>,
    auto: &[AutoCollector],
) -> Vec<Box<dyn MetricCollector>> {
    collectors.extend(auto.iter().map(|a| a.instantiate()));
    collectors
}

fn non_stub_devices(context: &InvocationContext) -> Vec<Arc<dyn Device>> {
    context
        .devices()
        .filter(|d| !d.is_stub())
        .cloned()
        .collect()
}

/// Captures a screenshot of every device when a test fails.
#[derive(Default)]
pub struct ScreenshotOnFailure {
    devices: Vec<Arc<dyn Device>>,
}

impl MetricCollector for ScreenshotOnFailure {
    fn name(&self) -> &str {
        "screenshot-on-failure"
    }

    fn init(&mut self, context: &InvocationContext) -> Result<()> {
        self.devices = non_stub_devices(context);
        Ok(())
    }

    fn on_test_fail(&mut self, data: &mut DeviceMetricData, test: &TestDescription) {
        for device in &self.devices {
            if let Some(shot) = device.capture_screenshot() {
                data.add_log(
                    format!("{}-{}-screenshot", test, device.serial()),
                    LogDataType::Screenshot,
                    shot,
                );
            }
        }
    }
}

/// Attaches the device log of every device when a test fails.
#[derive(Default)]
pub struct LogcatOnFailure {
    devices: Vec<Arc<dyn Device>>,
}

impl MetricCollector for LogcatOnFailure {
    fn name(&self) -> &str {
        "logcat-on-failure"
    }

    fn init(&mut self, context: &InvocationContext) -> Result<()> {
        self.devices = non_stub_devices(context);
        Ok(())
    }

    fn on_test_fail(&mut self, data: &mut DeviceMetricData, test: &TestDescription) {
        for device in &self.devices {
            if let Some(logcat) = device.logcat_snapshot() {
                data.add_log(
                    format!("{}-{}-logcat", test, device.serial()),
                    LogDataType::Logcat,
                    logcat,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::{CallLog, FakeDevice, RecordingSink, TaggingCollector};
    use invoker_domain::{DEFAULT_SLOT, FailureStatus};

    fn tagging_set(names: &[&str], log: &CallLog) -> CollectorSet {
        CollectorSet::new(
            names
                .iter()
                .map(|n| Box::new(TaggingCollector::new(n, log.clone())) as Box<dyn MetricCollector>)
                .collect(),
        )
    }

    #[test]
    fn test_metric_keys_in_reverse_registration_order() {
        let log = CallLog::new();
        let set = tagging_set(&["c1", "c2", "c3", "c4"], &log);
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let mut chain = MetricCollectorChain::wrap(&set, sink);

        chain.test_run_started("run", 0, 0);
        chain.test_run_ended(Duration::ZERO, &RunMetrics::new());

        let metrics = &recording.run_metrics()[0];
        assert_eq!(metrics.keys().collect::<Vec<_>>(), vec!["c4", "c3", "c2", "c1"]);
        assert_eq!(
            log.components_in("on_test_run_start"),
            vec!["c4", "c3", "c2", "c1"]
        );
    }

    #[test]
    fn test_raw_metrics_keep_precedence() {
        let log = CallLog::new();
        let set = tagging_set(&["c1"], &log);
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let mut chain = MetricCollectorChain::wrap(&set, sink);

        let mut raw = RunMetrics::new();
        raw.insert("raw", invoker_domain::Metric::text("1"));
        chain.test_run_started("run", 0, 0);
        chain.test_run_ended(Duration::ZERO, &raw);

        let keys: Vec<String> = recording.run_metrics()[0].keys().map(str::to_string).collect();
        assert_eq!(keys, vec!["raw", "c1"]);
    }

    #[test]
    fn test_screenshot_and_logcat_on_failure() {
        let ctx = InvocationContext::new("stub").with_device(
            DEFAULT_SLOT,
            Arc::new(FakeDevice::new("serial-0").with_logcat("boot ok")),
        );
        let set = CollectorSet::new(with_auto_collectors(
            Vec::new(),
            &[AutoCollector::ScreenshotOnFailure, AutoCollector::LogcatOnFailure],
        ));
        set.initialize(&ctx).expect("init");
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let mut chain = MetricCollectorChain::wrap(&set, sink);
        let test = TestDescription::new("Suite", "fails");

        chain.test_started(&test);
        chain.test_failed(
            &test,
            &FailureDescription::new("boom").with_status(FailureStatus::TestFailure),
        );
        chain.test_ended(&test, &RunMetrics::new());

        assert_eq!(
            recording.labels(),
            vec![
                "test_started:fails",
                "test_failed:fails",
                "test_log:Suite#fails-serial-0-logcat",
                "test_log:Suite#fails-serial-0-screenshot",
                "test_ended:fails",
            ]
        );
    }
}
