//! Metric collectors and the per-invocation set that owns them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::InvocationContext;
use crate::error::{InvocationError, Result};
use crate::result::{LogData, LogDataType, RunMetrics, TestDescription};

/// Metrics and logs a collector accumulates for one run or one test.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetricData {
    pub metrics: RunMetrics,
    pub logs: Vec<(String, LogDataType, LogData)>,
}

impl DeviceMetricData {
    pub fn add_log(&mut self, name: impl Into<String>, data_type: LogDataType, data: LogData) {
        self.logs.push((name.into(), data_type, data));
    }
}

/// Observes a test run and adds metrics to it.
///
/// Collectors never see the sink directly; what they put into
/// [`DeviceMetricData`] is merged into the forwarded events by the chain.
pub trait MetricCollector: Send {
    fn name(&self) -> &str;

    fn is_disabled(&self) -> bool {
        false
    }

    /// Called exactly once per invocation.
    fn init(&mut self, _context: &InvocationContext) -> Result<()> {
        Ok(())
    }

    fn on_test_run_start(&mut self, _data: &mut DeviceMetricData, _test_count: usize) {}

    fn on_test_run_end(&mut self, _data: &mut DeviceMetricData, _current: &RunMetrics) {}

    fn on_test_start(&mut self, _data: &mut DeviceMetricData) {}

    fn on_test_fail(&mut self, _data: &mut DeviceMetricData, _test: &TestDescription) {}

    fn on_test_end(&mut self, _data: &mut DeviceMetricData, _current: &RunMetrics) {}
}

/// Shared handle to one registered collector.
#[derive(Clone)]
pub struct CollectorHandle {
    name: String,
    collector: Arc<Mutex<Box<dyn MetricCollector>>>,
    initialized: Arc<AtomicBool>,
}

impl std::fmt::Debug for CollectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorHandle")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl CollectorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Run `f` with exclusive access to the collector.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn MetricCollector) -> R) -> R {
        let mut guard = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }

    fn initialize(&self, context: &InvocationContext) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(InvocationError::CollectorAlreadyInitialized {
                name: self.name.clone(),
            });
        }
        self.with(|c| c.init(context))
    }
}

/// The enabled collectors of one invocation, in registration order.
#[derive(Clone, Debug, Default)]
pub struct CollectorSet {
    handles: Vec<CollectorHandle>,
}

impl CollectorSet {
    /// Disabled collectors are dropped here and never initialized.
    pub fn new(collectors: Vec<Box<dyn MetricCollector>>) -> Self {
        let handles = collectors
            .into_iter()
            .filter(|c| {
                if c.is_disabled() {
                    tracing::debug!(collector = %c.name(), "skipping disabled collector");
                    false
                } else {
                    true
                }
            })
            .map(|c| CollectorHandle {
                name: c.name().to_string(),
                collector: Arc::new(Mutex::new(c)),
                initialized: Arc::new(AtomicBool::new(false)),
            })
            .collect();
        Self { handles }
    }

    /// Initialize every collector. Fails fast on a collector that was
    /// already initialized.
    pub fn initialize(&self, context: &InvocationContext) -> Result<()> {
        for handle in &self.handles {
            handle.initialize(context)?;
        }
        Ok(())
    }

    pub fn handles(&self) -> &[CollectorHandle] {
        &self.handles
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{CallLog, TaggingCollector};

    #[test]
    fn test_disabled_collectors_are_excluded() {
        let log = CallLog::new();
        let set = CollectorSet::new(vec![
            Box::new(TaggingCollector::new("c1", log.clone())),
            Box::new(TaggingCollector::new("c2", log.clone()).disabled()),
        ]);
        assert_eq!(set.names(), vec!["c1"]);

        set.initialize(&InvocationContext::new("stub")).expect("init");
        assert_eq!(log.phases_of("c1"), vec!["init"]);
        assert!(log.phases_of("c2").is_empty());
    }

    #[test]
    fn test_second_initialize_fails_fast() {
        let log = CallLog::new();
        let set = CollectorSet::new(vec![Box::new(TaggingCollector::new("c1", log.clone()))]);
        let ctx = InvocationContext::new("stub");

        set.initialize(&ctx).expect("first init");
        let err = set.initialize(&ctx).unwrap_err();
        assert_eq!(
            err,
            InvocationError::CollectorAlreadyInitialized {
                name: "c1".to_string()
            }
        );
        assert_eq!(log.phases_of("c1"), vec!["init"]);
    }
}
