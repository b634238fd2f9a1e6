//! Invocation configuration.
//!
//! [`CommandOptions`] and [`RetryConfig`] are plain serde structs (every
//! field defaulted) so they can be loaded from JSON. [`InvocationConfig`]
//! holds the trait objects one invocation is composed of and is assembled
//! through [`InvocationConfigBuilder`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use invoker_domain::{
    BuildProvider, InvocationError, LogSaver, MetricCollector, PostProcessor, Preparer,
    RemoteTest, Result, ResultSink,
};

use crate::log_saver::InMemoryLogSaver;
use crate::preparer::PreparerSpec;
use crate::sandbox::Sandbox;
use crate::shard::Rescheduler;
use crate::telemetry::HostLogBuffer;

// ---------------------------------------------------------------------------
// Serializable options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    #[default]
    NoRetry,
    /// Always run the configured number of attempts.
    Iterations,
    /// Re-run while the previous attempt had a failure.
    RetryAnyFailure,
    /// Re-run while attempts keep passing.
    RerunUntilFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub auto_retry: bool,
    pub max_testcase_run_count: u32,
    pub strategy: RetryStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: false,
            max_testcase_run_count: 1,
            strategy: RetryStrategy::NoRetry,
        }
    }
}

impl RetryConfig {
    pub fn iterations(count: u32) -> Self {
        Self {
            auto_retry: true,
            max_testcase_run_count: count,
            strategy: RetryStrategy::Iterations,
        }
    }

    pub fn retry_any_failure(count: u32) -> Self {
        Self {
            auto_retry: true,
            max_testcase_run_count: count,
            strategy: RetryStrategy::RetryAnyFailure,
        }
    }

    /// Whether retries can happen at all under this configuration.
    pub fn is_active(&self) -> bool {
        self.auto_retry && self.max_testcase_run_count > 1 && self.strategy != RetryStrategy::NoRetry
    }
}

/// Collectors the engine adds on its own when asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoCollector {
    ScreenshotOnFailure,
    LogcatOnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandOptions {
    pub test_tag: String,
    pub shard_count: Option<usize>,
    pub shard_index: Option<usize>,
    pub use_sandboxing: bool,
    pub bugreport_on_invocation_ended: bool,
    pub host_log_suffix: Option<String>,
    pub auto_collectors: Vec<AutoCollector>,
    pub retry: RetryConfig,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            test_tag: "stub".to_string(),
            shard_count: None,
            shard_index: None,
            use_sandboxing: false,
            bugreport_on_invocation_ended: false,
            host_log_suffix: None,
            auto_collectors: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl CommandOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| InvocationError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        match (self.shard_count, self.shard_index) {
            (Some(0), _) => Err(InvocationError::Config(
                "shard count must be at least 1".to_string(),
            )),
            (Some(count), Some(index)) if index >= count => Err(InvocationError::Config(format!(
                "shard index {index} is out of range for {count} shards"
            ))),
            (None, Some(index)) => Err(InvocationError::Config(format!(
                "shard index {index} given without a shard count"
            ))),
            _ => Ok(()),
        }
    }

    /// Name of the final host log reported to listeners.
    pub fn host_log_name(&self) -> String {
        match &self.host_log_suffix {
            Some(suffix) => format!("host_log{suffix}"),
            None => "host_log".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationConfig
// ---------------------------------------------------------------------------

/// Everything one invocation is composed of.
pub struct InvocationConfig {
    pub options: CommandOptions,
    pub command_line: Vec<String>,
    pub build_providers: Vec<(String, Arc<dyn BuildProvider>)>,
    pub preparers: PreparerSpec,
    pub tests: Vec<Arc<dyn RemoteTest>>,
    pub collectors: Vec<Box<dyn MetricCollector>>,
    pub post_processors: Vec<Box<dyn PostProcessor>>,
    pub log_saver: Box<dyn LogSaver>,
    pub listeners: Vec<Box<dyn ResultSink>>,
    pub host_log: Option<HostLogBuffer>,
    pub rescheduler: Option<Arc<dyn Rescheduler>>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
}

impl InvocationConfig {
    pub fn builder() -> InvocationConfigBuilder {
        InvocationConfigBuilder::default()
    }

    pub fn provider_for(&self, slot: &str) -> Option<&Arc<dyn BuildProvider>> {
        self.build_providers
            .iter()
            .find(|(name, _)| name == slot)
            .map(|(_, p)| p)
    }
}

#[derive(Default)]
pub struct InvocationConfigBuilder {
    options: CommandOptions,
    command_line: Vec<String>,
    build_providers: Vec<(String, Arc<dyn BuildProvider>)>,
    preparers: PreparerSpec,
    tests: Vec<Arc<dyn RemoteTest>>,
    collectors: Vec<Box<dyn MetricCollector>>,
    post_processors: Vec<Box<dyn PostProcessor>>,
    log_saver: Option<Box<dyn LogSaver>>,
    listeners: Vec<Box<dyn ResultSink>>,
    host_log: Option<HostLogBuffer>,
    rescheduler: Option<Arc<dyn Rescheduler>>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl InvocationConfigBuilder {
    pub fn options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn command_line<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn build_provider(mut self, slot: &str, provider: Arc<dyn BuildProvider>) -> Self {
        self.build_providers.push((slot.to_string(), provider));
        self
    }

    pub fn multi_pre_target_preparer(mut self, preparer: Arc<dyn Preparer>) -> Self {
        self.preparers.multi_pre_target.push(preparer);
        self
    }

    pub fn device_preparer(mut self, slot: &str, preparer: Arc<dyn Preparer>) -> Self {
        self.preparers.add_device_preparer(slot, preparer);
        self
    }

    pub fn multi_target_preparer(mut self, preparer: Arc<dyn Preparer>) -> Self {
        self.preparers.multi_target.push(preparer);
        self
    }

    pub fn preparers(mut self, preparers: PreparerSpec) -> Self {
        self.preparers = preparers;
        self
    }

    pub fn test(mut self, test: Arc<dyn RemoteTest>) -> Self {
        self.tests.push(test);
        self
    }

    pub fn tests(mut self, tests: Vec<Arc<dyn RemoteTest>>) -> Self {
        self.tests = tests;
        self
    }

    pub fn collector(mut self, collector: Box<dyn MetricCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn post_processor(mut self, processor: Box<dyn PostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }

    pub fn log_saver(mut self, saver: Box<dyn LogSaver>) -> Self {
        self.log_saver = Some(saver);
        self
    }

    pub fn listener(mut self, listener: Box<dyn ResultSink>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn host_log(mut self, buffer: HostLogBuffer) -> Self {
        self.host_log = Some(buffer);
        self
    }

    pub fn rescheduler(mut self, rescheduler: Arc<dyn Rescheduler>) -> Self {
        self.rescheduler = Some(rescheduler);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Validate and assemble. Logs are kept in memory unless a saver is given.
    pub fn build(self) -> Result<InvocationConfig> {
        self.options.validate()?;
        if self.options.use_sandboxing && self.sandbox.is_none() {
            return Err(InvocationError::Config(
                "sandboxing requested without a sandbox".to_string(),
            ));
        }
        Ok(InvocationConfig {
            options: self.options,
            command_line: self.command_line,
            build_providers: self.build_providers,
            preparers: self.preparers,
            tests: self.tests,
            collectors: self.collectors,
            post_processors: self.post_processors,
            log_saver: self
                .log_saver
                .unwrap_or_else(|| Box::new(InMemoryLogSaver::new())),
            listeners: self.listeners,
            host_log: self.host_log,
            rescheduler: self.rescheduler,
            sandbox: self.sandbox,
        })
    }
}
