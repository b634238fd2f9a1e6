//! In-memory fakes for collaborator traits (testing only)
//!
//! Every fake records what happened to it in a shared [`CallLog`], so tests
//! assert on the recorded `(component, phase)` sequence instead of relying on
//! strict mock ordering.

use std::sync::{Arc, Mutex};

mod device;
mod providers;
mod runnable;
mod sink;

pub use device::FakeDevice;
pub use providers::{BuildOutcome, FakeBuildProvider, FakePreparer};
pub use runnable::{StubShardableTest, StubTest, TestOutcome};
pub use sink::{MemoryLogSaver, RecordingSink, SinkEvent, SinkRecording, TaggingCollector, TaggingProcessor};

// ---------------------------------------------------------------------------
// CallLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub component: String,
    pub phase: String,
    pub detail: Option<String>,
}

/// Shared, append-only record of calls made on fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, component: &str, phase: &str) {
        self.push(component, phase, None);
    }

    pub fn record_with(&self, component: &str, phase: &str, detail: impl Into<String>) {
        self.push(component, phase, Some(detail.into()));
    }

    fn push(&self, component: &str, phase: &str, detail: Option<String>) {
        self.calls.lock().unwrap().push(CallRecord {
            component: component.to_string(),
            phase: phase.to_string(),
            detail,
        });
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    /// `(component, phase)` pairs in call order.
    pub fn sequence(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .map(|c| (c.component, c.phase))
            .collect()
    }

    /// Call sequence restricted to one phase, as component names.
    pub fn components_in(&self, phase: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.phase == phase)
            .map(|c| c.component)
            .collect()
    }

    pub fn phases_of(&self, component: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.component == component)
            .map(|c| c.phase)
            .collect()
    }

    pub fn details_of(&self, component: &str, phase: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.component == component && c.phase == phase)
            .map(|c| c.detail)
            .collect()
    }

    pub fn count(&self, component: &str, phase: &str) -> usize {
        self.details_of(component, phase).len()
    }
}

/// Shorthand for building expected sequences in assertions.
pub fn seq(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(c, p)| (c.to_string(), p.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_log_sequence() {
        let log = CallLog::new();
        log.record("p1", "set_up");
        log.record_with("p1", "tear_down", "cause");
        log.record("p2", "set_up");

        assert_eq!(
            log.sequence(),
            seq(&[("p1", "set_up"), ("p1", "tear_down"), ("p2", "set_up")])
        );
        assert_eq!(log.components_in("set_up"), vec!["p1", "p2"]);
        assert_eq!(
            log.details_of("p1", "tear_down"),
            vec![Some("cause".to_string())]
        );
        assert_eq!(log.count("p2", "set_up"), 1);
    }
}
