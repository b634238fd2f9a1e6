use std::sync::Mutex;

use async_trait::async_trait;

use super::CallLog;
use crate::context::InvocationContext;
use crate::device::{Device, DeviceState, RecoveryMode};
use crate::error::{InvocationError, Result};
use crate::result::LogData;

/// Device fake; hook calls are recorded under the device serial.
#[derive(Debug)]
pub struct FakeDevice {
    serial: String,
    state: Mutex<DeviceState>,
    recovery: Mutex<RecoveryMode>,
    logcat: Option<LogData>,
    bugreports: bool,
    pre_setup_error: Option<InvocationError>,
    log: CallLog,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            state: Mutex::new(DeviceState::Online),
            recovery: Mutex::new(RecoveryMode::Available),
            logcat: None,
            bugreports: false,
            pre_setup_error: None,
            log: CallLog::new(),
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_logcat(mut self, contents: &str) -> Self {
        self.logcat = Some(LogData::from(contents));
        self
    }

    pub fn with_bugreports(mut self) -> Self {
        self.bugreports = true;
        self
    }

    pub fn failing_pre_setup(mut self, error: InvocationError) -> Self {
        self.pre_setup_error = Some(error);
        self
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn serial(&self) -> String {
        self.serial.clone()
    }

    fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery.lock().unwrap()
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        self.log
            .record_with(&self.serial, "set_recovery_mode", format!("{:?}", mode));
        *self.recovery.lock().unwrap() = mode;
    }

    async fn pre_invocation_setup(&self, _context: &InvocationContext) -> Result<()> {
        self.log.record(&self.serial, "pre_invocation_setup");
        match &self.pre_setup_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn post_invocation_tear_down(&self, cause: Option<&InvocationError>) {
        self.log.record_with(
            &self.serial,
            "post_invocation_tear_down",
            cause.map(|c| c.to_string()).unwrap_or_default(),
        );
    }

    async fn capture_bugreport(&self, name: &str) -> Option<LogData> {
        self.log.record_with(&self.serial, "bugreport", name);
        self.bugreports
            .then(|| LogData::new(format!("bugreport of {}", self.serial).into_bytes()))
    }

    fn logcat_snapshot(&self) -> Option<LogData> {
        self.logcat.clone()
    }

    fn capture_screenshot(&self) -> Option<LogData> {
        self.log.record(&self.serial, "screenshot");
        Some(LogData::new(vec![0x89, b'P', b'N', b'G']))
    }
}
