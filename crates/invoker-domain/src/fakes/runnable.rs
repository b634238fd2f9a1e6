use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CallLog;
use crate::error::{InvocationError, Result};
use crate::failure::{FailureDescription, FailureStatus};
use crate::result::{LogData, LogDataType, RunMetrics, TestDescription};
use crate::sink::ResultSink;
use crate::test_info::TestInformation;
use crate::traits::{RemoteTest, ShardableTest, TestCapabilities, TestRunInput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Pass,
    Fail(String),
}

/// Test runnable emitting one run of canned test cases.
#[derive(Debug)]
pub struct StubTest {
    name: String,
    cases: Vec<(TestDescription, TestOutcome)>,
    failing_attempts: u32,
    error: Option<InvocationError>,
    logs_per_test: bool,
    capabilities: TestCapabilities,
    runs: AtomicU32,
    log: CallLog,
}

impl StubTest {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            cases: Vec::new(),
            failing_attempts: 0,
            error: None,
            logs_per_test: false,
            capabilities: TestCapabilities::default(),
            runs: AtomicU32::new(0),
            log,
        }
    }

    pub fn with_case(mut self, test_name: &str, outcome: TestOutcome) -> Self {
        self.cases
            .push((TestDescription::new(self.name.clone(), test_name), outcome));
        self
    }

    /// Every case fails during the first `attempts` runs.
    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.failing_attempts = attempts;
        self
    }

    pub fn failing_with(mut self, error: InvocationError) -> Self {
        self.error = Some(error);
        self
    }

    /// Log one text file per test case and attempt.
    pub fn logging_per_test(mut self) -> Self {
        self.logs_per_test = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: TestCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn run_count(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTest for StubTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> TestCapabilities {
        self.capabilities
    }

    async fn run(&self, input: &TestRunInput<'_>, sink: &mut dyn ResultSink) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let detail = match &input.device {
            Some(device) => format!("attempt={} device={}", input.attempt, device.serial()),
            None => format!("attempt={}", input.attempt),
        };
        self.log.record_with(&self.name, "run", detail);
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        sink.test_run_started(&self.name, self.cases.len(), input.attempt);
        for (test, outcome) in &self.cases {
            sink.test_started(test);
            let failure = match outcome {
                TestOutcome::Fail(message) => Some(message.clone()),
                TestOutcome::Pass if run < self.failing_attempts => {
                    Some(format!("flaky failure on run {run}"))
                }
                TestOutcome::Pass => None,
            };
            if let Some(message) = failure {
                sink.test_failed(
                    test,
                    &FailureDescription::new(message).with_status(FailureStatus::TestFailure),
                );
            }
            if self.logs_per_test {
                sink.test_log(
                    &format!("{}-log", test.test_name),
                    LogDataType::Text,
                    &LogData::new(format!("{} attempt {}", test, input.attempt).into_bytes()),
                );
            }
            sink.test_ended(test, &RunMetrics::new());
        }
        sink.test_run_ended(Duration::from_millis(10), &RunMetrics::new());
        Ok(())
    }
}

/// Shardable test splitting into `pieces` single-case stub tests.
#[derive(Debug)]
pub struct StubShardableTest {
    name: String,
    pieces: usize,
    log: CallLog,
}

impl StubShardableTest {
    pub fn new(name: &str, pieces: usize, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            pieces,
            log,
        }
    }

    fn piece(&self, index: usize) -> StubTest {
        StubTest::new(&format!("{}-{}", self.name, index), self.log.clone())
            .with_case(&format!("case{index}"), TestOutcome::Pass)
    }
}

#[async_trait]
impl RemoteTest for StubShardableTest {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &TestRunInput<'_>, sink: &mut dyn ResultSink) -> Result<()> {
        for index in 0..self.pieces {
            self.piece(index).run(input, sink).await?;
        }
        Ok(())
    }

    fn as_shardable(&self) -> Option<&dyn ShardableTest> {
        Some(self)
    }
}

impl ShardableTest for StubShardableTest {
    fn split(&self, _shard_count: Option<usize>, _info: &TestInformation) -> Option<Vec<Arc<dyn RemoteTest>>> {
        self.log.record_with(&self.name, "split", self.pieces.to_string());
        if self.pieces < 2 {
            return None;
        }
        Some(
            (0..self.pieces)
                .map(|i| Arc::new(self.piece(i)) as Arc<dyn RemoteTest>)
                .collect(),
        )
    }
}
