//! Invocation executor: the top-level state machine.
//!
//! One executor drives one invocation through its fixed phases:
//! - fetch a build for every device slot
//! - shard (when configured) and hand the shards to a rescheduler
//! - device pre-invocation hooks and preparer setup
//! - run every test through the retry coordinator (or a sandbox)
//! - tear down, device post-invocation hooks, log finalization
//! - release every fetched build
//!
//! Whatever fails, teardown and build cleanup still run, listeners see
//! exactly one `invocation_failed` (the original cause) and exactly one
//! `invocation_ended`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use invoker_domain::{
    ActionInProgress, CollectorSet, Device, DeviceState, FailureDescription, FailureStatus,
    InvocationContext, InvocationError, LogData, LogDataType, LogFile, MetricCollector,
    ModuleContext, RecoveryMode, RemoteTest, Result, ResultSink, RunMetrics, Summary,
    TestDescription, TestInformation, TestRunInput, COMMAND_ARGS_KEY,
};

use crate::collector::with_auto_collectors;
use crate::config::{CommandOptions, InvocationConfig};
use crate::fetch::{BuildFetcher, CleanupReport, FetchedBuilds};
use crate::forwarder::{LogSaverForwarder, ResultForwarder, SharedSink};
use crate::metrics::InvocationMetrics;
use crate::obs;
use crate::preparer::PreparerChain;
use crate::processor::PostProcessorChain;
use crate::retry::{ResultAggregator, RetryCoordinator};
use crate::sandbox::{Sandbox, SandboxRequest};
use crate::shard::{Rescheduler, ShardCoordinator, ShardMainForwarder};
use crate::telemetry::HostLogBuffer;

pub const HOST_LOG_BEFORE_SHARDING: &str = "host_log_before_sharding";
pub const DEVICE_LOG_NAME_PREFIX: &str = "device_logcat_";
pub const BUILD_ERROR_BUGREPORT: &str = "build_error_bugreport";
pub const TARGET_SETUP_ERROR_BUGREPORT: &str = "target_setup_error_bugreport";
pub const DEVICE_UNRESPONSIVE_BUGREPORT: &str = "device_unresponsive_bugreport";
pub const INVOCATION_ENDED_BUGREPORT: &str = "invocation_ended_bugreport";
pub const SHARD_COUNT_KEY: &str = "shard_count";
pub const SHARD_INDEX_KEY: &str = "shard_index";

type Stack = LogSaverForwarder<PostProcessorChain<SharedSink>>;

/// Whether the test step runs in this process or in a sandbox child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Regular,
    SandboxParent,
}

impl RunMode {
    pub fn of(options: &CommandOptions) -> Self {
        if options.use_sandboxing {
            RunMode::SandboxParent
        } else {
            RunMode::Regular
        }
    }
}

/// Requests cancellation of a running invocation.
///
/// The run loop checks the handle between tests. The first reason given
/// is the one reported.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    reason: Arc<Mutex<Option<String>>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// What the caller gets back from a completed invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub invocation_id: Uuid,
    pub success: bool,
    /// The one failure reported to listeners, if any.
    pub failure: Option<FailureDescription>,
    /// The tests ran in shards; results reach the listeners through the
    /// shards, not through this outcome.
    pub sharded: bool,
    pub summaries: Vec<Summary>,
    pub metrics: Vec<(String, String)>,
    pub cleanup_warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// InvocationExecutor
// ---------------------------------------------------------------------------

pub struct InvocationExecutor {
    config: InvocationConfig,
    stop: StopHandle,
}

impl InvocationExecutor {
    pub fn new(config: InvocationConfig) -> Self {
        Self {
            config,
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run a fresh invocation for `context`.
    pub async fn invoke(self, context: InvocationContext) -> Result<InvocationOutcome> {
        let info = TestInformation::new(context)?;
        self.invoke_with_information(info).await
    }

    /// Run an invocation on prepared test information (used for shards).
    ///
    /// Returns `Err` only for errors that must reach the caller after full
    /// teardown (device loss, fatal host errors) and for a teardown error
    /// that was the first failure; every other failure is reported to the
    /// listeners and described in the outcome.
    pub async fn invoke_with_information(self, info: TestInformation) -> Result<InvocationOutcome> {
        let span = obs::invocation_span(info.context().invocation_id(), info.context().test_tag());
        self.execute(info).instrument(span).await
    }

    async fn execute(self, mut info: TestInformation) -> Result<InvocationOutcome> {
        let InvocationConfig {
            options,
            command_line,
            build_providers,
            preparers,
            tests,
            collectors,
            post_processors,
            log_saver,
            listeners,
            host_log,
            rescheduler,
            sandbox,
        } = self.config;

        let id = info.context().invocation_id();
        record_invocation_attributes(info.context_mut(), &options, &command_line);
        let metrics = Arc::new(InvocationMetrics::new());
        let aggregate = options.retry.is_active() && ResultAggregator::needs_aggregation(&listeners);
        let listeners: SharedSink = if aggregate {
            debug!("merging retried runs for non-granular listeners");
            SharedSink::new(ResultAggregator::new(listeners)).erase()
        } else {
            SharedSink::new(ResultForwarder::new(listeners)).erase()
        };
        let stack = LogSaverForwarder::new(
            log_saver,
            PostProcessorChain::wrap(post_processors, listeners.clone()),
        )
        .with_metrics(Arc::clone(&metrics));

        let mut run = InvocationRun {
            id,
            mode: RunMode::of(&options),
            options,
            command_line,
            stack,
            metrics,
            host_log,
            stop: self.stop,
            started: Instant::now(),
            reported: None,
            test_started: false,
        };

        // Fetch
        run.phase(ActionInProgress::FetchingArtifacts);
        let fetch_started = Instant::now();
        let fetcher = BuildFetcher::new(build_providers, &run.command_line);
        let fetched = match fetcher.fetch(info.context_mut()).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                run.metrics
                    .record_phase(ActionInProgress::FetchingArtifacts, fetch_started.elapsed());
                return Ok(run.fetch_failed(&mut info, failure.error, failure.cleanup));
            }
        };
        run.metrics
            .record_phase(ActionInProgress::FetchingArtifacts, fetch_started.elapsed());

        // Shard
        if let Some(rescheduler) = run.shard_target(rescheduler.as_ref()) {
            match run.try_shard(&info, &tests, &fetched, rescheduler, &listeners) {
                Some(scheduled) => return Ok(run.sharded(scheduled, fetched).await),
                None => debug!("running inline"),
            }
        }

        run.stack.invocation_started(info.context());
        obs::emit_invocation_started(id, &info.context().serials());
        info.context_mut().lock_attributes();

        // A shard running in place brings its devices up before anything else.
        let devices_ready = run.is_in_place_shard();
        if devices_ready {
            run.phase(ActionInProgress::Setup);
            if let Err(failure) = run.device_pre_setup(info.context()).await {
                return run.early_device_setup_failed(&mut info, failure.error, fetched).await;
            }
        }

        let mut chain = PreparerChain::new(preparers);
        let step = if tests.is_empty() && run.mode == RunMode::Regular {
            info!("No tests to run");
            if devices_ready {
                Ok(())
            } else {
                run.device_pre_setup(info.context()).await
            }
        } else {
            run.prepare_and_run(&info, &mut chain, &tests, collectors, sandbox.as_deref(), devices_ready)
                .await
        };

        if run.test_started {
            run.report_device_logs(info.context(), "test");
        }

        let (cause, bugreport) = match step {
            Ok(()) => (None, None),
            Err(failure) => {
                let (error, bugreport) = run.handle_failure(info.context(), failure).await;
                (Some(error), bugreport)
            }
        };
        run.take_bugreports(info.context(), bugreport).await;

        // Teardown
        run.phase(ActionInProgress::TearDown);
        let teardown_started = Instant::now();
        let teardown_error = match chain.tear_down(&info, cause.as_ref(), &mut run.stack).await {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "exception when tearing down invocation");
                if cause.is_none() {
                    run.report(FailureDescription::from_error(&err, ActionInProgress::TearDown));
                }
                Some(err)
            }
        };
        run.device_post_tear_down(info.context(), cause.as_ref()).await;
        run.metrics
            .record_phase(ActionInProgress::TearDown, teardown_started.elapsed());

        let mut outcome = run.finish(&mut info, "teardown");

        // Release
        run.phase(ActionInProgress::FreeResources);
        let report = fetched.clean_up().await;
        outcome.cleanup_warnings = run.cleanup_warnings(&report);
        outcome.metrics = run.metrics.snapshot();

        match (cause, teardown_error) {
            (Some(cause), _) if cause.is_rethrown() => Err(cause),
            (None, Some(teardown)) => Err(teardown),
            _ => Ok(outcome),
        }
    }
}

/// Record the command line and shard position on the context so listeners
/// see them from `invocation_started` on. Values inherited from a parent are
/// kept as they are.
fn record_invocation_attributes(
    context: &mut InvocationContext,
    options: &CommandOptions,
    command_line: &[String],
) {
    let mut attributes = Vec::new();
    if !command_line.is_empty() {
        attributes.push((COMMAND_ARGS_KEY, command_line.join(" ")));
    }
    if let Some(count) = options.shard_count {
        attributes.push((SHARD_COUNT_KEY, count.to_string()));
    }
    if let Some(index) = options.shard_index {
        attributes.push((SHARD_INDEX_KEY, index.to_string()));
    }
    for (key, value) in attributes {
        if !context.attributes().get(key).is_empty() {
            continue;
        }
        if let Err(err) = context.add_attribute(key, value) {
            warn!(key, error = %err, "invocation attribute not recorded");
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationRun
// ---------------------------------------------------------------------------

/// A failure raised in some phase.
struct PhaseFailure {
    action: ActionInProgress,
    error: InvocationError,
}

impl PhaseFailure {
    fn new(action: ActionInProgress, error: InvocationError) -> Self {
        Self { action, error }
    }
}

/// State of one invocation while it runs.
struct InvocationRun {
    id: Uuid,
    mode: RunMode,
    options: CommandOptions,
    command_line: Vec<String>,
    stack: Stack,
    metrics: Arc<InvocationMetrics>,
    host_log: Option<HostLogBuffer>,
    stop: StopHandle,
    started: Instant,
    reported: Option<FailureDescription>,
    test_started: bool,
}

impl InvocationRun {
    fn phase(&self, action: ActionInProgress) {
        obs::emit_phase_started(self.id, action);
    }

    /// Report `failure` unless one was reported already.
    fn report(&mut self, failure: FailureDescription) {
        if let Some(first) = &self.reported {
            debug!(
                first = %first.message,
                dropped = %failure.message,
                "invocation failure already reported"
            );
            return;
        }
        obs::emit_invocation_failed(self.id, failure.action, &failure.message);
        self.stack.invocation_failed(&failure);
        self.reported = Some(failure);
    }

    fn report_device_logs(&mut self, context: &InvocationContext, stage: &str) {
        for device in context.devices().filter(|d| !d.is_stub()) {
            if let Some(logcat) = device.logcat_snapshot() {
                let name = format!("{DEVICE_LOG_NAME_PREFIX}{stage}_{}", device.serial());
                self.stack.test_log(&name, LogDataType::Logcat, &logcat);
            }
        }
    }

    fn report_host_log(&mut self, name: &str) {
        if let Some(log) = self.host_log.as_ref().and_then(HostLogBuffer::take) {
            self.stack.test_log(name, LogDataType::HostLog, &log);
        }
    }

    fn cleanup_warnings(&self, report: &CleanupReport) -> Vec<String> {
        self.metrics
            .add_cleanup_failures(report.failures.len() as u64);
        let warnings = report.warnings();
        for warning in &warnings {
            warn!(warning = %warning, "build cleanup incomplete");
        }
        warnings
    }

    // -- fetch failure -------------------------------------------------------

    fn fetch_failed(
        mut self,
        info: &mut TestInformation,
        error: InvocationError,
        cleanup: CleanupReport,
    ) -> InvocationOutcome {
        warn!(error = %error, "build fetch failed");
        self.stack.invocation_started(info.context());
        obs::emit_invocation_started(self.id, &info.context().serials());
        self.report(
            FailureDescription::from_error(&error, ActionInProgress::FetchingArtifacts)
                .with_status(FailureStatus::InfraFailure),
        );
        let warnings = self.cleanup_warnings(&cleanup);
        let mut outcome = self.finish(info, "error");
        outcome.cleanup_warnings = warnings;
        outcome.metrics = self.metrics.snapshot();
        outcome
    }

    // -- sharding ------------------------------------------------------------

    /// Both shard count and index given: this invocation is one shard and
    /// never splits again.
    fn is_in_place_shard(&self) -> bool {
        self.mode == RunMode::Regular
            && self.options.shard_count.is_some()
            && self.options.shard_index.is_some()
    }

    /// Device setup of an in-place shard failed before any preparer ran.
    async fn early_device_setup_failed(
        mut self,
        info: &mut TestInformation,
        error: InvocationError,
        fetched: FetchedBuilds,
    ) -> Result<InvocationOutcome> {
        warn!(error = %error, "device setup of in-place shard failed");
        self.device_post_tear_down(info.context(), Some(&error)).await;
        self.report(
            FailureDescription::from_error(&error, ActionInProgress::Setup)
                .with_status(FailureStatus::InfraFailure),
        );
        let mut outcome = self.finish(info, "error");

        self.phase(ActionInProgress::FreeResources);
        let report = fetched.clean_up().await;
        outcome.cleanup_warnings = self.cleanup_warnings(&report);
        outcome.metrics = self.metrics.snapshot();

        if error.is_rethrown() {
            Err(error)
        } else {
            Ok(outcome)
        }
    }

    fn shard_target<'a>(&self, rescheduler: Option<&'a Arc<dyn Rescheduler>>) -> Option<&'a dyn Rescheduler> {
        let count = self.options.shard_count.unwrap_or(1);
        if count < 2 || self.options.shard_index.is_some() || self.mode == RunMode::SandboxParent {
            return None;
        }
        match rescheduler {
            Some(rescheduler) => Some(rescheduler.as_ref()),
            None => {
                warn!(shard_count = count, "sharding requested without a rescheduler");
                None
            }
        }
    }

    /// Split and schedule the shards. `None` means the invocation runs
    /// inline instead; nothing has been reported to the listeners then.
    fn try_shard(
        &mut self,
        info: &TestInformation,
        tests: &[Arc<dyn RemoteTest>],
        fetched: &FetchedBuilds,
        rescheduler: &dyn Rescheduler,
        listeners: &SharedSink,
    ) -> Option<usize> {
        let coordinator = ShardCoordinator::new(self.options.shard_count.unwrap_or(1));
        let assignment = coordinator.split(tests, info)?;

        let mut forwarder = ShardMainForwarder::new(listeners.clone(), assignment.len());
        forwarder.mark_started();
        let main = SharedSink::new(forwarder);
        let plan = match coordinator.plan(
            assignment,
            info,
            fetched,
            &self.options,
            &self.command_line,
            &main,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "could not prepare shards");
                return None;
            }
        };

        self.stack.invocation_started(info.context());
        obs::emit_invocation_started(self.id, &info.context().serials());
        self.report_host_log(HOST_LOG_BEFORE_SHARDING);
        self.stack.finish_saver(self.started.elapsed());

        let count = plan.len();
        let scheduled = coordinator.schedule(plan, rescheduler, &main);
        obs::emit_sharded(self.id, count, scheduled);
        Some(scheduled)
    }

    async fn sharded(self, scheduled: usize, fetched: FetchedBuilds) -> InvocationOutcome {
        debug!(scheduled, "parent releasing its own builds");
        let report = fetched.clean_up().await;
        let cleanup_warnings = self.cleanup_warnings(&report);
        InvocationOutcome {
            invocation_id: self.id,
            success: true,
            failure: None,
            sharded: true,
            summaries: Vec::new(),
            metrics: self.metrics.snapshot(),
            cleanup_warnings,
        }
    }

    // -- setup and run -------------------------------------------------------

    async fn device_pre_setup(&mut self, context: &InvocationContext) -> std::result::Result<(), PhaseFailure> {
        let devices: Vec<Arc<dyn Device>> = context.devices().cloned().collect();
        for device in devices {
            device
                .pre_invocation_setup(context)
                .await
                .map_err(|e| PhaseFailure::new(ActionInProgress::Setup, e))?;
        }
        Ok(())
    }

    async fn device_post_tear_down(&mut self, context: &InvocationContext, cause: Option<&InvocationError>) {
        let devices: Vec<Arc<dyn Device>> = context.devices().cloned().collect();
        for device in devices {
            device.post_invocation_tear_down(cause).await;
        }
    }

    async fn prepare_and_run(
        &mut self,
        info: &TestInformation,
        chain: &mut PreparerChain,
        tests: &[Arc<dyn RemoteTest>],
        collectors: Vec<Box<dyn MetricCollector>>,
        sandbox: Option<&dyn Sandbox>,
        devices_ready: bool,
    ) -> std::result::Result<(), PhaseFailure> {
        self.phase(ActionInProgress::Setup);
        let setup_started = Instant::now();
        if !devices_ready {
            self.device_pre_setup(info.context()).await?;
        }

        if self.mode == RunMode::SandboxParent {
            self.metrics
                .record_phase(ActionInProgress::Setup, setup_started.elapsed());
            return self.run_sandbox(info, sandbox).await;
        }

        let setup = chain.set_up(info, &mut self.stack).await;
        self.metrics
            .record_phase(ActionInProgress::Setup, setup_started.elapsed());
        setup.map_err(|e| PhaseFailure::new(ActionInProgress::Setup, e))?;

        self.phase(ActionInProgress::Test);
        self.test_started = true;
        let test_started = Instant::now();
        let result = self.run_tests(info, tests, collectors).await;
        self.metrics
            .record_phase(ActionInProgress::Test, test_started.elapsed());
        result.map_err(|e| PhaseFailure::new(ActionInProgress::Test, e))
    }

    async fn run_tests(
        &mut self,
        info: &TestInformation,
        tests: &[Arc<dyn RemoteTest>],
        collectors: Vec<Box<dyn MetricCollector>>,
    ) -> Result<()> {
        let collectors = CollectorSet::new(with_auto_collectors(collectors, &self.options.auto_collectors));
        collectors.initialize(info.context())?;
        let retry = RetryCoordinator::new(self.options.retry.clone());

        for test in tests {
            if let Some(reason) = self.stop.reason() {
                info!(reason = %reason, "stop requested, skipping remaining tests");
                return Err(InvocationError::Interrupted(reason));
            }
            let input = TestRunInput::for_capabilities(info, test.capabilities(), &collectors);
            let stats = retry
                .run(test.as_ref(), &input, &collectors, &mut self.stack, &self.metrics)
                .await?;
            debug!(
                test = %test.name(),
                attempts = stats.attempts,
                failed_attempts = stats.failed_attempts,
                "test finished"
            );
        }
        Ok(())
    }

    async fn run_sandbox(
        &mut self,
        info: &TestInformation,
        sandbox: Option<&dyn Sandbox>,
    ) -> std::result::Result<(), PhaseFailure> {
        let sandbox = sandbox.ok_or_else(|| {
            PhaseFailure::new(
                ActionInProgress::Setup,
                InvocationError::Config("sandboxing requested without a sandbox".to_string()),
            )
        })?;
        self.phase(ActionInProgress::Test);
        self.test_started = true;
        let started = Instant::now();
        let request = SandboxRequest::for_invocation(info.context(), &self.command_line);

        let mut replay = SandboxReplay::new(&mut self.stack);
        let result = sandbox.run(&request, &mut replay).await;
        let child_failures = replay.into_failures();
        self.metrics
            .record_phase(ActionInProgress::Test, started.elapsed());
        info!(status = ?result.status, events = result.events, "sandbox run finished");

        if let Some(failure) = FailureDescription::join(child_failures) {
            self.report(failure);
        }
        match result.to_error() {
            Some(err) => Err(PhaseFailure::new(ActionInProgress::Test, err)),
            None => Ok(()),
        }
    }

    // -- failure classification ---------------------------------------------

    /// Report `failure` and apply its side effects on devices. Returns the
    /// error and the bugreport it calls for.
    async fn handle_failure(
        &mut self,
        context: &InvocationContext,
        failure: PhaseFailure,
    ) -> (InvocationError, Option<(&'static str, Option<Arc<dyn Device>>)>) {
        let PhaseFailure { action, error } = failure;
        let bad_device = error
            .device_serial()
            .and_then(|serial| context.device_by_serial(serial))
            .cloned();

        let bugreport = match &error {
            InvocationError::Build { failed_to_boot, .. } => {
                warn!(error = %error, "build error");
                if *failed_to_boot {
                    match &bad_device {
                        Some(device) => device.set_recovery_mode(RecoveryMode::None),
                        None => context.set_recovery_mode_for_all(RecoveryMode::None),
                    }
                }
                self.report(FailureDescription::from_error(&error, ActionInProgress::Setup));
                Some(BUILD_ERROR_BUGREPORT)
            }
            InvocationError::TargetSetup { .. } => {
                warn!(error = %error, "target setup error");
                self.report(FailureDescription::from_error(&error, ActionInProgress::Setup));
                Some(TARGET_SETUP_ERROR_BUGREPORT)
            }
            InvocationError::DeviceNotAvailable {
                serial,
                unresponsive,
                ..
            } => {
                warn!(
                    serial = %serial,
                    error = %error,
                    "invocation did not complete due to device becoming not available"
                );
                let online = bad_device
                    .as_ref()
                    .is_some_and(|d| d.state() == DeviceState::Online);
                self.report(FailureDescription::from_error(&error, action));
                if let Some(device) = &bad_device {
                    device.set_recovery_mode(RecoveryMode::None);
                }
                (*unresponsive && online).then_some(DEVICE_UNRESPONSIVE_BUGREPORT)
            }
            InvocationError::Interrupted(_) => {
                warn!("invocation interrupted");
                if !self.stop.is_stopped() {
                    self.report(
                        FailureDescription::from_error(&error, action)
                            .with_status(FailureStatus::Unset),
                    );
                }
                None
            }
            _ => {
                warn!(error = %error, action = %action, "unexpected error when running invocation");
                self.report(FailureDescription::from_error(&error, action));
                None
            }
        };
        (error, bugreport.map(|name| (name, bad_device)))
    }

    /// Capture bugreports for a failure, or at the end of the invocation
    /// when asked to. A known bad device, or the only device, gets one;
    /// otherwise every device is captured concurrently.
    async fn take_bugreports(
        &mut self,
        context: &InvocationContext,
        failure: Option<(&'static str, Option<Arc<dyn Device>>)>,
    ) {
        let (name, bad_device) = match failure {
            Some(found) => {
                if self.options.bugreport_on_invocation_ended {
                    info!("bugreport taken for the failure instead of invocation ended");
                }
                found
            }
            None if self.options.bugreport_on_invocation_ended => (INVOCATION_ENDED_BUGREPORT, None),
            None => return,
        };

        let targets: Vec<Arc<dyn Device>> = match bad_device {
            Some(device) => vec![device],
            None => context.devices().filter(|d| !d.is_stub()).cloned().collect(),
        };
        let captures = join_all(targets.iter().map(|device| async move {
            let report_name = format!("{name}_{}", device.serial());
            let data = device.capture_bugreport(&report_name).await;
            (report_name, data)
        }))
        .await;
        for (report_name, data) in captures {
            match data {
                Some(data) => self.stack.test_log(&report_name, LogDataType::Bugreport, &data),
                None => debug!(bugreport = %report_name, "device produced no bugreport"),
            }
        }
    }

    // -- finalization --------------------------------------------------------

    /// Device logs, cancellation, host log, metrics and `invocation_ended`.
    fn finish(&mut self, info: &mut TestInformation, stage: &str) -> InvocationOutcome {
        self.report_device_logs(info.context(), stage);
        if let Some(reason) = self.stop.reason() {
            let message = format!(
                "Invocation was interrupted due to: {reason}, results will be affected."
            );
            self.report(FailureDescription::new(message).with_status(FailureStatus::Cancelled));
        }
        let host_log_name = self.options.host_log_name();
        self.report_host_log(&host_log_name);

        let id = self.id.to_string();
        info.context_mut()
            .record_invocation_metrics(self.metrics.snapshot());
        self.metrics.flush(&id);

        let elapsed = self.started.elapsed();
        self.stack.invocation_ended(elapsed);
        let success = self.reported.is_none();
        obs::emit_invocation_finished(self.id, elapsed.as_millis() as u64, success);

        InvocationOutcome {
            invocation_id: self.id,
            success,
            failure: self.reported.clone(),
            sharded: false,
            summaries: self.stack.summaries(),
            metrics: Vec::new(),
            cleanup_warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxReplay
// ---------------------------------------------------------------------------

/// Sink handed to a sandbox: forwards the child's events to the parent's
/// stack but holds back its invocation failures, which the parent reports
/// itself.
struct SandboxReplay<'a> {
    inner: &'a mut Stack,
    failures: Vec<FailureDescription>,
}

impl<'a> SandboxReplay<'a> {
    fn new(inner: &'a mut Stack) -> Self {
        Self {
            inner,
            failures: Vec::new(),
        }
    }

    fn into_failures(self) -> Vec<FailureDescription> {
        self.failures
    }
}

impl ResultSink for SandboxReplay<'_> {
    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.failures.push(failure.clone());
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
        self.inner.test_log(name, data_type, data)
    }

    fn test_log_saved(&mut self, name: &str, data_type: LogDataType, data: &LogData, saved: &LogFile) {
        self.inner.test_log_saved(name, data_type, data, saved)
    }

    fn log_association(&mut self, name: &str, saved: &LogFile) {
        self.inner.log_association(name, saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handle_keeps_first_reason() {
        let handle = StopHandle::new();
        assert!(!handle.is_stopped());

        let clone = handle.clone();
        clone.stop("host shutdown");
        handle.stop("second request");

        assert!(handle.is_stopped());
        assert_eq!(handle.reason().as_deref(), Some("host shutdown"));
    }

    #[test]
    fn test_run_mode_follows_sandboxing_option() {
        let mut options = CommandOptions::default();
        assert_eq!(RunMode::of(&options), RunMode::Regular);
        options.use_sandboxing = true;
        assert_eq!(RunMode::of(&options), RunMode::SandboxParent);
    }
}
