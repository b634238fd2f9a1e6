//! Device handle abstraction.
//!
//! The transport behind a device is out of scope; the engine only needs the
//! hooks below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::InvocationContext;
use crate::error::{InvocationError, Result};
use crate::result::LogData;

/// How aggressively the transport may try to recover an unresponsive device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    #[default]
    Available,
    OnlineOnly,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    NotAvailable,
}

#[async_trait]
pub trait Device: Send + Sync {
    fn serial(&self) -> String;

    fn state(&self) -> DeviceState;

    fn recovery_mode(&self) -> RecoveryMode;

    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Placeholder devices carry no transport (host-only slots).
    fn is_stub(&self) -> bool {
        false
    }

    /// Called once before any preparer runs.
    async fn pre_invocation_setup(&self, _context: &InvocationContext) -> Result<()> {
        Ok(())
    }

    /// Called once after every preparer was torn down.
    async fn post_invocation_tear_down(&self, _cause: Option<&InvocationError>) {}

    /// Capture a bugreport; `None` when the device cannot produce one.
    async fn capture_bugreport(&self, _name: &str) -> Option<LogData> {
        None
    }

    /// Snapshot of the device log buffer collected so far.
    fn logcat_snapshot(&self) -> Option<LogData> {
        None
    }

    fn capture_screenshot(&self) -> Option<LogData> {
        None
    }
}
