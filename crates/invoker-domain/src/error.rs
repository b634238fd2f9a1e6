//! Error taxonomy for invocation phases

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failure::FailureStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationError {
    #[error("Build retrieval failed: {message}")]
    BuildRetrieval { message: String },

    #[error("Build error on {}: {message}", serial_or_unknown(.device_serial))]
    Build {
        message: String,
        device_serial: Option<String>,
        failed_to_boot: bool,
    },

    #[error("Target setup failed on {}: {message}", serial_or_unknown(.device_serial))]
    TargetSetup {
        message: String,
        device_serial: Option<String>,
    },

    #[error("Device {serial} not available: {message}")]
    DeviceNotAvailable {
        serial: String,
        message: String,
        unresponsive: bool,
    },

    #[error("Invocation interrupted: {0}")]
    Interrupted(String),

    #[error("Fatal host error: {0}")]
    FatalHost(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Metric collector {name} was already initialized for this invocation")]
    CollectorAlreadyInitialized { name: String },

    #[error("Attributes are locked, cannot add {key}")]
    AttributesLocked { key: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Tear down failed: {first}{}", suppressed_suffix(.suppressed))]
    TearDown {
        first: Box<InvocationError>,
        trigger: Option<Box<InvocationError>>,
        suppressed: usize,
    },
}

fn serial_or_unknown(serial: &Option<String>) -> &str {
    serial.as_deref().unwrap_or("unknown device")
}

fn suppressed_suffix(suppressed: &usize) -> String {
    if *suppressed == 0 {
        String::new()
    } else {
        format!(" (+{suppressed} more)")
    }
}

impl From<std::io::Error> for InvocationError {
    fn from(err: std::io::Error) -> Self {
        InvocationError::Io(err.to_string())
    }
}

impl InvocationError {
    /// Short stable name of the error kind, used as the failure's error identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationError::BuildRetrieval { .. } => "BUILD_RETRIEVAL_ERROR",
            InvocationError::Build { .. } => "BUILD_ERROR",
            InvocationError::TargetSetup { .. } => "TARGET_SETUP_ERROR",
            InvocationError::DeviceNotAvailable { .. } => "DEVICE_NOT_AVAILABLE",
            InvocationError::Interrupted(_) => "RUN_INTERRUPTED",
            InvocationError::FatalHost(_) => "FATAL_HOST_ERROR",
            InvocationError::Runtime(_) => "HARNESS_RUNTIME_ERROR",
            InvocationError::CollectorAlreadyInitialized { .. } => "COLLECTOR_REINITIALIZED",
            InvocationError::AttributesLocked { .. } => "ATTRIBUTES_LOCKED",
            InvocationError::Config(_) => "CONFIGURATION_ERROR",
            InvocationError::Io(_) => "IO_ERROR",
            InvocationError::TearDown { first, .. } => first.kind(),
        }
    }

    /// Failure status reported for this error when nothing more specific is known.
    pub fn failure_status(&self) -> FailureStatus {
        match self {
            InvocationError::BuildRetrieval { .. }
            | InvocationError::Build { .. }
            | InvocationError::TargetSetup { .. }
            | InvocationError::DeviceNotAvailable { .. }
            | InvocationError::TearDown { .. } => FailureStatus::InfraFailure,
            _ => FailureStatus::Unset,
        }
    }

    /// Serial of the device this error is attributed to, if any.
    pub fn device_serial(&self) -> Option<&str> {
        match self {
            InvocationError::Build { device_serial, .. }
            | InvocationError::TargetSetup { device_serial, .. } => device_serial.as_deref(),
            InvocationError::DeviceNotAvailable { serial, .. } => Some(serial),
            InvocationError::TearDown { first, .. } => first.device_serial(),
            _ => None,
        }
    }

    /// Errors that are returned to the caller once teardown has completed.
    pub fn is_rethrown(&self) -> bool {
        matches!(
            self,
            InvocationError::DeviceNotAvailable { .. } | InvocationError::FatalHost(_)
        )
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        InvocationError::Runtime(message.into())
    }

    pub fn target_setup(message: impl Into<String>, device_serial: Option<String>) -> Self {
        InvocationError::TargetSetup {
            message: message.into(),
            device_serial,
        }
    }

    pub fn build_retrieval(message: impl Into<String>) -> Self {
        InvocationError::BuildRetrieval {
            message: message.into(),
        }
    }
}

/// Result type for invocation operations
pub type Result<T> = std::result::Result<T, InvocationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tear_down_display_mentions_suppressed() {
        let err = InvocationError::TearDown {
            first: Box::new(InvocationError::runtime("boom")),
            trigger: None,
            suppressed: 2,
        };
        assert_eq!(err.to_string(), "Tear down failed: boom (+2 more)");
        assert_eq!(err.kind(), "HARNESS_RUNTIME_ERROR");
    }

    #[test]
    fn test_device_serial_attribution() {
        let err = InvocationError::DeviceNotAvailable {
            serial: "serial-1".to_string(),
            message: "gone".to_string(),
            unresponsive: false,
        };
        assert_eq!(err.device_serial(), Some("serial-1"));
        assert!(err.is_rethrown());
        assert_eq!(err.failure_status(), FailureStatus::InfraFailure);

        let setup = InvocationError::target_setup("flash failed", None);
        assert_eq!(setup.device_serial(), None);
        assert!(setup.to_string().contains("unknown device"));
        assert!(!setup.is_rethrown());
    }
}
