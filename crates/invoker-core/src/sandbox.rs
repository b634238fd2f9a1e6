//! Running the test step of an invocation in a child process.
//!
//! The parent keeps fetch, device hooks and build cleanup; the child runs
//! preparers and tests and reports through an [`EventStreamSink`], one JSON
//! event per line on stdout. [`ProcessSandbox`] reads that stream and
//! replays it into the parent's listeners. Raw logs travel hex-encoded and
//! are saved again on the parent side.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use invoker_domain::{
    FailureDescription, InvocationContext, InvocationError, LogData, LogDataType, LogFile,
    ModuleContext, ResultSink, RunMetrics, TestDescription,
};

/// Environment variable carrying the JSON [`SandboxRequest`] to the child.
pub const REQUEST_ENV: &str = "INVOKER_SANDBOX_REQUEST";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
const STDERR_TAIL: usize = 2048;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// What the child needs to know about the parent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub invocation_id: String,
    pub test_tag: String,
    pub command_line: Vec<String>,
    /// `(slot, serial)` of every allocated device.
    pub devices: Vec<(String, String)>,
    /// `(slot, build id)` of every fetched build.
    pub builds: Vec<(String, String)>,
}

impl SandboxRequest {
    pub fn for_invocation(context: &InvocationContext, command_line: &[String]) -> Self {
        Self {
            invocation_id: context.invocation_id().to_string(),
            test_tag: context.test_tag().to_string(),
            command_line: command_line.to_vec(),
            devices: context
                .slots()
                .iter()
                .map(|s| (s.name.clone(), s.device.serial()))
                .collect(),
            builds: context
                .builds()
                .map(|(slot, b)| (slot.to_string(), b.build_id.clone()))
                .collect(),
        }
    }

    /// Read the request handed down by the parent.
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var(REQUEST_ENV)
            .with_context(|| format!("{REQUEST_ENV} is not set"))?;
        serde_json::from_str(&raw).context("invalid sandbox request")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Success,
    Failed,
    TimedOut,
    Exception,
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub error: Option<String>,
    pub events: usize,
}

impl CommandResult {
    pub fn success(events: usize) -> Self {
        Self {
            status: CommandStatus::Success,
            exit_code: Some(0),
            stderr: String::new(),
            error: None,
            events,
        }
    }

    pub fn exception(error: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Exception,
            exit_code: None,
            stderr: String::new(),
            error: Some(error.into()),
            events: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// The error the parent reports for an unsuccessful run.
    pub fn to_error(&self) -> Option<InvocationError> {
        if self.is_success() {
            return None;
        }
        let detail = self
            .error
            .clone()
            .or_else(|| (!self.stderr.is_empty()).then(|| self.stderr.clone()))
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_string(),
            });
        Some(InvocationError::runtime(format!(
            "sandbox run {:?}: {}",
            self.status, detail
        )))
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, request: &SandboxRequest, sink: &mut dyn ResultSink) -> CommandResult;
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// One result callback as it crosses the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SandboxEvent {
    InvocationFailed {
        failure: FailureDescription,
    },
    ModuleStarted {
        module: ModuleContext,
    },
    ModuleEnded,
    RunStarted {
        name: String,
        test_count: usize,
        attempt: u32,
    },
    RunFailed {
        failure: FailureDescription,
    },
    RunEnded {
        elapsed_ms: u64,
        #[serde(default)]
        metrics: RunMetrics,
    },
    TestStarted {
        test: TestDescription,
    },
    TestFailed {
        test: TestDescription,
        failure: FailureDescription,
    },
    TestEnded {
        test: TestDescription,
        #[serde(default)]
        metrics: RunMetrics,
    },
    TestLog {
        name: String,
        data_type: LogDataType,
        data_hex: String,
    },
}

impl SandboxEvent {
    pub fn replay(self, sink: &mut dyn ResultSink) -> anyhow::Result<()> {
        match self {
            SandboxEvent::InvocationFailed { failure } => sink.invocation_failed(&failure),
            SandboxEvent::ModuleStarted { module } => sink.test_module_started(&module),
            SandboxEvent::ModuleEnded => sink.test_module_ended(),
            SandboxEvent::RunStarted {
                name,
                test_count,
                attempt,
            } => sink.test_run_started(&name, test_count, attempt),
            SandboxEvent::RunFailed { failure } => sink.test_run_failed(&failure),
            SandboxEvent::RunEnded {
                elapsed_ms,
                metrics,
            } => sink.test_run_ended(Duration::from_millis(elapsed_ms), &metrics),
            SandboxEvent::TestStarted { test } => sink.test_started(&test),
            SandboxEvent::TestFailed { test, failure } => sink.test_failed(&test, &failure),
            SandboxEvent::TestEnded { test, metrics } => sink.test_ended(&test, &metrics),
            SandboxEvent::TestLog {
                name,
                data_type,
                data_hex,
            } => {
                let bytes = hex::decode(&data_hex)
                    .with_context(|| format!("log {name} is not valid hex"))?;
                sink.test_log(&name, data_type, &LogData::new(bytes));
            }
        }
        Ok(())
    }
}

/// Child-side sink writing every callback as one JSON line.
///
/// Saved-log callbacks are not sent; the parent saves the raw logs itself.
/// Write errors are logged and the event dropped.
pub struct EventStreamSink<W> {
    out: W,
    written: usize,
}

impl<W: Write + Send> EventStreamSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, event: &SandboxEvent) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    fn emit(&mut self, event: SandboxEvent) {
        match self.write_line(&event) {
            Ok(()) => self.written += 1,
            Err(err) => tracing::warn!(error = %err, "failed to write sandbox event"),
        }
    }
}

impl<W: Write + Send> ResultSink for EventStreamSink<W> {
    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.emit(SandboxEvent::InvocationFailed {
            failure: failure.clone(),
        });
    }

    fn test_module_started(&mut self, module: &ModuleContext) {
        self.emit(SandboxEvent::ModuleStarted {
            module: module.clone(),
        });
    }

    fn test_module_ended(&mut self) {
        self.emit(SandboxEvent::ModuleEnded);
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.emit(SandboxEvent::RunStarted {
            name: name.to_string(),
            test_count,
            attempt,
        });
    }

    fn test_run_failed(&mut self, failure: &FailureDescription) {
        self.emit(SandboxEvent::RunFailed {
            failure: failure.clone(),
        });
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &RunMetrics) {
        self.emit(SandboxEvent::RunEnded {
            elapsed_ms: elapsed.as_millis() as u64,
            metrics: metrics.clone(),
        });
    }

    fn test_started(&mut self, test: &TestDescription) {
        self.emit(SandboxEvent::TestStarted { test: test.clone() });
    }

    fn test_failed(&mut self, test: &TestDescription, failure: &FailureDescription) {
        self.emit(SandboxEvent::TestFailed {
            test: test.clone(),
            failure: failure.clone(),
        });
    }

    fn test_ended(&mut self, test: &TestDescription, metrics: &RunMetrics) {
        self.emit(SandboxEvent::TestEnded {
            test: test.clone(),
            metrics: metrics.clone(),
        });
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, data: &LogData) {
        self.emit(SandboxEvent::TestLog {
            name: name.to_string(),
            data_type,
            data_hex: hex::encode(data.as_bytes()),
        });
    }

    fn test_log_saved(&mut self, _name: &str, _data_type: LogDataType, _data: &LogData, _saved: &LogFile) {}

    fn log_association(&mut self, _name: &str, _saved: &LogFile) {}
}

// ---------------------------------------------------------------------------
// ProcessSandbox
// ---------------------------------------------------------------------------

/// Runs a child program and replays the events it prints on stdout.
///
/// Lines that are not events are logged at debug level and skipped. The
/// child is killed when the timeout expires.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn execute(
        &self,
        request: &SandboxRequest,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<CommandResult> {
        let payload = serde_json::to_string(request).context("serialize sandbox request")?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(REQUEST_ENV, payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn sandbox {}", self.program.display()))?;

        let stdout = child.stdout.take().context("sandbox stdout not captured")?;
        let mut stderr = child.stderr.take().context("sandbox stderr not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        });

        let pump = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut events = 0;
            while let Some(line) = lines.next_line().await.context("read sandbox stdout")? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SandboxEvent>(&line) {
                    Ok(event) => {
                        event.replay(sink)?;
                        events += 1;
                    }
                    Err(err) => tracing::debug!(line = %line, error = %err, "skipping non-event output"),
                }
            }
            let status = child.wait().await.context("wait for sandbox")?;
            anyhow::Ok((status, events))
        };
        let outcome = tokio::time::timeout(self.timeout, pump).await;

        let (status, events) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                child.start_kill().ok();
                tracing::warn!(
                    program = %self.program.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "sandbox timed out"
                );
                return Ok(CommandResult {
                    status: CommandStatus::TimedOut,
                    exit_code: None,
                    stderr: String::new(),
                    error: Some(format!(
                        "sandbox timed out after {} ms",
                        self.timeout.as_millis()
                    )),
                    events: 0,
                });
            }
        };

        let stderr = match stderr_task.await {
            Ok(Ok(text)) => tail(&text, STDERR_TAIL),
            Ok(Err(err)) => format!("<stderr unreadable: {err}>"),
            Err(err) => format!("<stderr reader failed: {err}>"),
        };
        Ok(CommandResult {
            status: if status.success() {
                CommandStatus::Success
            } else {
                CommandStatus::Failed
            },
            exit_code: status.code(),
            stderr,
            error: None,
            events,
        })
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, request: &SandboxRequest, sink: &mut dyn ResultSink) -> CommandResult {
        match self.execute(request, sink).await {
            Ok(result) => result,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(error = %message, "sandbox failed");
                CommandResult::exception(message)
            }
        }
    }
}
