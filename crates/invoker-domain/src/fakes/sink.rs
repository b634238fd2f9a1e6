use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::CallLog;
use crate::collector::{DeviceMetricData, MetricCollector};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::failure::FailureDescription;
use crate::result::{
    LogData, LogDataType, LogFile, Metric, ModuleContext, RunMetrics, Summary, TestDescription,
};
use crate::sink::ResultSink;
use crate::traits::{LogSaver, PostProcessor};

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// One callback received by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    InvocationStarted {
        invocation_id: String,
        attributes: BTreeMap<String, Vec<String>>,
    },
    InvocationFailed(FailureDescription),
    InvocationEnded,
    ModuleStarted(String),
    ModuleEnded,
    RunStarted { name: String, test_count: usize, attempt: u32 },
    RunFailed(FailureDescription),
    RunEnded(RunMetrics),
    TestStarted(TestDescription),
    TestFailed(TestDescription, String),
    TestEnded(TestDescription, RunMetrics),
    TestLog(String),
    TestLogSaved(String, LogFile),
    LogAssociation(String, LogFile),
}

/// Read side of a [`RecordingSink`] that stays usable after the sink was
/// moved into an invocation.
#[derive(Debug, Clone, Default)]
pub struct SinkRecording {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl SinkRecording {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&SinkEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn run_starts(&self) -> Vec<(String, usize, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::RunStarted {
                    name,
                    test_count,
                    attempt,
                } => Some((name, test_count, attempt)),
                _ => None,
            })
            .collect()
    }

    pub fn run_metrics(&self) -> Vec<RunMetrics> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::RunEnded(metrics) => Some(metrics),
                _ => None,
            })
            .collect()
    }

    /// Context attributes seen by each `invocation_started`.
    pub fn started_attributes(&self) -> Vec<BTreeMap<String, Vec<String>>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::InvocationStarted { attributes, .. } => Some(attributes),
                _ => None,
            })
            .collect()
    }

    pub fn invocation_failures(&self) -> Vec<FailureDescription> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::InvocationFailed(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn associations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::LogAssociation(name, _) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Compact labels of every event, for sequence assertions.
    pub fn labels(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| match e {
                SinkEvent::InvocationStarted { .. } => "invocation_started".to_string(),
                SinkEvent::InvocationFailed(_) => "invocation_failed".to_string(),
                SinkEvent::InvocationEnded => "invocation_ended".to_string(),
                SinkEvent::ModuleStarted(m) => format!("module_started:{m}"),
                SinkEvent::ModuleEnded => "module_ended".to_string(),
                SinkEvent::RunStarted { name, attempt, .. } => {
                    format!("run_started:{name}:{attempt}")
                }
                SinkEvent::RunFailed(_) => "run_failed".to_string(),
                SinkEvent::RunEnded(_) => "run_ended".to_string(),
                SinkEvent::TestStarted(t) => format!("test_started:{}", t.test_name),
                SinkEvent::TestFailed(t, _) => format!("test_failed:{}", t.test_name),
                SinkEvent::TestEnded(t, _) => format!("test_ended:{}", t.test_name),
                SinkEvent::TestLog(n) => format!("test_log:{n}"),
                SinkEvent::TestLogSaved(n, _) => format!("test_log_saved:{n}"),
                SinkEvent::LogAssociation(n, _) => format!("log_association:{n}"),
            })
            .collect()
    }
}

/// Terminal sink recording every callback it receives.
#[derive(Debug)]
pub struct RecordingSink {
    name: String,
    recording: SinkRecording,
    granular: bool,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recording: SinkRecording::default(),
            granular: true,
        }
    }

    /// Ask for merged results when runs are retried.
    pub fn aggregated(mut self) -> Self {
        self.granular = false;
        self
    }

    pub fn recording(&self) -> SinkRecording {
        self.recording.clone()
    }

    fn push(&self, event: SinkEvent) {
        self.recording.events.lock().unwrap().push(event);
    }
}

impl ResultSink for RecordingSink {
    fn invocation_started(&mut self, context: &InvocationContext) {
        self.push(SinkEvent::InvocationStarted {
            invocation_id: context.invocation_id().to_string(),
            attributes: context
                .attributes()
                .iter()
                .map(|(key, values)| (key.to_string(), values.to_vec()))
                .collect(),
        });
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.push(SinkEvent::InvocationFailed(failure.clone()));
    }

    fn invocation_ended(&mut self, _elapsed: Duration) {
        self.push(SinkEvent::InvocationEnded);
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.push(SinkEvent::ModuleStarted(module.module_id.clone()));
    }

    fn test_module_ended(&mut self) {
        self.push(SinkEvent::ModuleEnded);
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.push(SinkEvent::RunStarted {
            name: name.to_string(),
            test_count,
            attempt,
        });
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.push(SinkEvent::RunFailed(failure.clone()));
    }

    fn test_run_ended(&mut self, _elapsed: Duration, metrics: &RunMetrics) {
        self.push(SinkEvent::RunEnded(metrics.clone()));
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.push(SinkEvent::TestStarted(test.clone()));
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.push(SinkEvent::TestFailed(test.clone(), failure.message.clone()));
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.push(SinkEvent::TestEnded(test.clone(), metrics.clone()));
    }

    fn test_log(&mut self, name: &str, _data_type: LogDataType, _data: &LogData) {
        self.push(SinkEvent::TestLog(name.to_string()));
    }

    fn test_log_saved(&mut self, name: &str, _data_type: LogDataType, _data: &LogData, saved: &LogFile) {
        self.push(SinkEvent::TestLogSaved(name.to_string(), saved.clone()));
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.push(SinkEvent::LogAssociation(name.to_string(), saved.clone()));
    }

    fn summary(&self) -> Option<Summary> {
        Some(Summary {
            reporter: self.name.clone(),
            label: format!("{} events", self.recording.events.lock().unwrap().len()),
            source: None,
        })
    }

    fn supports_granular_results(&self) -> bool {
        self.granular
    }
}

// ---------------------------------------------------------------------------
// MemoryLogSaver
// ---------------------------------------------------------------------------

/// Log saver keeping saved logs in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSaver {
    saved: Arc<Mutex<Vec<(String, LogFile)>>>,
}

impl MemoryLogSaver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<(String, LogFile)> {
        self.saved.lock().unwrap().clone()
    }
}

impl LogSaver for MemoryLogSaver {
    fn save_log_data(&mut self, name: &str, data_type: LogDataType, data: &LogData) -> Result<LogFile> {
        let mut saved = self.saved.lock().unwrap();
        let file = LogFile {
            path: PathBuf::from(format!(
                "memory/{}_{}.{}",
                name,
                saved.len(),
                data_type.extension()
            )),
            url: None,
            data_type,
            digest: data.digest(),
            size: data.len() as u64,
        };
        saved.push((name.to_string(), file.clone()));
        Ok(file)
    }
}

// ---------------------------------------------------------------------------
// TaggingCollector / TaggingProcessor
// ---------------------------------------------------------------------------

/// Collector writing a metric keyed by its own name at run end.
#[derive(Debug)]
pub struct TaggingCollector {
    name: String,
    disabled: bool,
    log: CallLog,
}

impl TaggingCollector {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            disabled: false,
            log,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

impl MetricCollector for TaggingCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn init(&mut self, _context: &InvocationContext) -> Result<()> {
        self.log.record(&self.name, "init");
        Ok(())
    }

    fn on_test_run_start(&mut self, _data: &mut DeviceMetricData, _test_count: usize) {
        self.log.record(&self.name, "on_test_run_start");
    }

    fn on_test_run_end(&mut self, data: &mut DeviceMetricData, _current: &RunMetrics) {
        self.log.record(&self.name, "on_test_run_end");
        data.metrics.insert(self.name.clone(), Metric::text(self.name.clone()));
    }
}

/// Post processor deriving one metric keyed by its own name; the value is
/// the number of logs associated with the run.
#[derive(Debug)]
pub struct TaggingProcessor {
    name: String,
    disabled: bool,
}

impl TaggingProcessor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            disabled: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

impl PostProcessor for TaggingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn process_run_metrics_and_logs(&mut self, _raw: &RunMetrics, logs: &[(String, LogFile)]) -> RunMetrics {
        let mut derived = RunMetrics::new();
        derived.insert(self.name.clone(), Metric::text(logs.len().to_string()));
        derived
    }
}
