use std::sync::Mutex;

use async_trait::async_trait;

use super::CallLog;
use crate::build::BuildRecord;
use crate::error::{InvocationError, Result};
use crate::result::{LogData, LogDataType};
use crate::test_info::TestInformation;
use crate::traits::{BuildProvider, BuildRequest, CapturedLog, LogSource, Preparer};

// ---------------------------------------------------------------------------
// FakeBuildProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Build(BuildRecord),
    NoBuild,
    Fail(InvocationError),
}

/// Build provider returning a canned outcome and recording cleanups.
#[derive(Debug)]
pub struct FakeBuildProvider {
    name: String,
    outcome: BuildOutcome,
    cleanup_error: Option<InvocationError>,
    wants_context: bool,
    log: CallLog,
    cleaned: Mutex<Vec<BuildRecord>>,
}

impl FakeBuildProvider {
    pub fn new(name: &str, outcome: BuildOutcome, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            cleanup_error: None,
            wants_context: false,
            log,
            cleaned: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(name: &str, build_id: &str, log: CallLog) -> Self {
        Self::new(name, BuildOutcome::Build(BuildRecord::new(build_id)), log)
    }

    pub fn failing_cleanup(mut self, error: InvocationError) -> Self {
        self.cleanup_error = Some(error);
        self
    }

    pub fn wanting_context(mut self) -> Self {
        self.wants_context = true;
        self
    }

    pub fn cleaned_builds(&self) -> Vec<BuildRecord> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildProvider for FakeBuildProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn wants_invocation_context(&self) -> bool {
        self.wants_context
    }

    async fn get_build(&self, request: &BuildRequest<'_>) -> Result<Option<BuildRecord>> {
        match request.context {
            Some(ctx) => self.log.record_with(&self.name, "get_build", ctx.test_tag()),
            None => self.log.record(&self.name, "get_build"),
        }
        match &self.outcome {
            BuildOutcome::Build(record) => Ok(Some(record.clone())),
            BuildOutcome::NoBuild => Ok(None),
            BuildOutcome::Fail(err) => Err(err.clone()),
        }
    }

    async fn clean_up(&self, build: &BuildRecord) -> Result<()> {
        self.log
            .record_with(&self.name, "clean_up", build.build_id.clone());
        self.cleaned.lock().unwrap().push(build.clone());
        match &self.cleanup_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakePreparer
// ---------------------------------------------------------------------------

/// Preparer fake.
///
/// `set_up` records the serial of the active device (empty for host-only
/// information) and `tear_down` records the cause it was handed.
#[derive(Debug)]
pub struct FakePreparer {
    name: String,
    disabled: bool,
    tear_down_disabled: bool,
    set_up_error: Option<InvocationError>,
    tear_down_error: Option<InvocationError>,
    captures_logs: bool,
    captured: Mutex<Vec<CapturedLog>>,
    log: CallLog,
}

impl FakePreparer {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.to_string(),
            disabled: false,
            tear_down_disabled: false,
            set_up_error: None,
            tear_down_error: None,
            captures_logs: false,
            captured: Mutex::new(Vec::new()),
            log,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn tear_down_disabled(mut self) -> Self {
        self.tear_down_disabled = true;
        self
    }

    pub fn failing_set_up(mut self, error: InvocationError) -> Self {
        self.set_up_error = Some(error);
        self
    }

    pub fn failing_tear_down(mut self, error: InvocationError) -> Self {
        self.tear_down_error = Some(error);
        self
    }

    pub fn capturing_logs(mut self) -> Self {
        self.captures_logs = true;
        self
    }

    fn capture(&self, phase: &str) {
        if self.captures_logs {
            self.captured.lock().unwrap().push(CapturedLog {
                name: format!("{}-{}", self.name, phase),
                data_type: LogDataType::Text,
                data: LogData::new(format!("{} {}", self.name, phase).into_bytes()),
            });
        }
    }
}

#[async_trait]
impl Preparer for FakePreparer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn is_tear_down_disabled(&self) -> bool {
        self.tear_down_disabled
    }

    async fn set_up(&self, info: &TestInformation) -> Result<()> {
        let serial = info.device().map(|d| d.serial()).unwrap_or_default();
        self.log.record_with(&self.name, "set_up", serial);
        self.capture("set_up");
        match &self.set_up_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn tear_down(&self, _info: &TestInformation, cause: Option<&InvocationError>) -> Result<()> {
        self.log.record_with(
            &self.name,
            "tear_down",
            cause.map(|c| c.to_string()).unwrap_or_default(),
        );
        self.capture("tear_down");
        match &self.tear_down_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn as_log_source(&self) -> Option<&dyn LogSource> {
        if self.captures_logs {
            Some(self)
        } else {
            None
        }
    }
}

impl LogSource for FakePreparer {
    fn drain_logs(&self) -> Vec<CapturedLog> {
        std::mem::take(&mut *self.captured.lock().unwrap())
    }
}
