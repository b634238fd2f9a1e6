//! Failure descriptions reported to result sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvocationError;

/// Coarse classification of a failure for reporting backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    #[default]
    Unset,
    InfraFailure,
    TestFailure,
    Cancelled,
    NotExecuted,
}

/// Phase the invocation was in when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionInProgress {
    #[default]
    Unset,
    FetchingArtifacts,
    Setup,
    Test,
    TearDown,
    FreeResources,
}

impl std::fmt::Display for ActionInProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionInProgress::Unset => "unset",
            ActionInProgress::FetchingArtifacts => "fetching_artifacts",
            ActionInProgress::Setup => "setup",
            ActionInProgress::Test => "test",
            ActionInProgress::TearDown => "tear_down",
            ActionInProgress::FreeResources => "free_resources",
        };
        write!(f, "{}", s)
    }
}

/// A reported failure, at invocation, run or test scope.
///
/// Several failures can be joined into one (see [`FailureDescription::join`]);
/// the joined failure keeps every part in `related`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDescription {
    pub message: String,
    pub status: FailureStatus,
    pub action: ActionInProgress,
    pub error_kind: Option<String>,
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<FailureDescription>,
    pub timestamp: DateTime<Utc>,
}

impl FailureDescription {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: FailureStatus::Unset,
            action: ActionInProgress::Unset,
            error_kind: None,
            origin: None,
            related: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a description from an error raised during `action`.
    pub fn from_error(error: &InvocationError, action: ActionInProgress) -> Self {
        Self {
            message: error.to_string(),
            status: error.failure_status(),
            action,
            error_kind: Some(error.kind().to_string()),
            origin: None,
            related: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: FailureStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_action(mut self, action: ActionInProgress) -> Self {
        self.action = action;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Join several failures into one multi-failure.
    ///
    /// A single failure is returned as is. The joined status is the first
    /// non-`Unset` status among the parts.
    pub fn join(failures: Vec<FailureDescription>) -> Option<FailureDescription> {
        match failures.len() {
            0 => None,
            1 => failures.into_iter().next(),
            n => {
                let message = format!(
                    "There were {} failures:\n  {}",
                    n,
                    failures
                        .iter()
                        .map(|f| f.message.as_str())
                        .collect::<Vec<_>>()
                        .join("\n  ")
                );
                let status = failures
                    .iter()
                    .map(|f| f.status)
                    .find(|s| *s != FailureStatus::Unset)
                    .unwrap_or_default();
                let action = failures[0].action;
                Some(FailureDescription {
                    message,
                    status,
                    action,
                    error_kind: None,
                    origin: None,
                    related: failures,
                    timestamp: Utc::now(),
                })
            }
        }
    }

    pub fn is_multi(&self) -> bool {
        !self.related.is_empty()
    }
}
