//! Ordered setup and reverse teardown of environment preparers.
//!
//! Setup runs host-pre preparers, then each device slot's chain (slot
//! order, with that slot made the active device), then host-post preparers.
//! Every preparer whose `set_up` was called is tracked, the failing one
//! included, and teardown walks that list backwards.

use std::sync::Arc;

use invoker_domain::{InvocationError, Preparer, Result, ResultSink, TestInformation};

use crate::obs;

/// Preparers of one invocation, grouped by scope.
#[derive(Clone, Default)]
pub struct PreparerSpec {
    /// Host scope, before any device preparer.
    pub multi_pre_target: Vec<Arc<dyn Preparer>>,
    /// One ordered chain per device slot.
    pub device_chains: Vec<(String, Vec<Arc<dyn Preparer>>)>,
    /// Host scope, after the device preparers.
    pub multi_target: Vec<Arc<dyn Preparer>>,
}

impl PreparerSpec {
    pub fn add_device_preparer(&mut self, slot: &str, preparer: Arc<dyn Preparer>) {
        match self.device_chains.iter_mut().find(|(name, _)| name == slot) {
            Some((_, chain)) => chain.push(preparer),
            None => self.device_chains.push((slot.to_string(), vec![preparer])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.multi_pre_target.is_empty()
            && self.multi_target.is_empty()
            && self.device_chains.iter().all(|(_, chain)| chain.is_empty())
    }

    fn chain_for(&self, slot: &str) -> Option<&[Arc<dyn Preparer>]> {
        self.device_chains
            .iter()
            .find(|(name, _)| name == slot)
            .map(|(_, chain)| chain.as_slice())
    }
}

impl std::fmt::Debug for PreparerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |list: &[Arc<dyn Preparer>]| -> Vec<String> {
            list.iter().map(|p| p.name().to_string()).collect()
        };
        f.debug_struct("PreparerSpec")
            .field("multi_pre_target", &names(&self.multi_pre_target))
            .field(
                "device_chains",
                &self
                    .device_chains
                    .iter()
                    .map(|(slot, chain)| (slot.clone(), names(chain)))
                    .collect::<Vec<_>>(),
            )
            .field("multi_target", &names(&self.multi_target))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparerPhase {
    NotStarted,
    HostPreSetup,
    DeviceSetup,
    HostPostSetup,
    Running,
    HostPostTeardown,
    DeviceTeardown,
    HostPreTeardown,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    HostPre,
    Device(usize),
    HostPost,
}

impl Scope {
    fn teardown_phase(self) -> PreparerPhase {
        match self {
            Scope::HostPost => PreparerPhase::HostPostTeardown,
            Scope::Device(_) => PreparerPhase::DeviceTeardown,
            Scope::HostPre => PreparerPhase::HostPreTeardown,
        }
    }
}

struct Tracked {
    preparer: Arc<dyn Preparer>,
    scope: Scope,
}

pub struct PreparerChain {
    spec: PreparerSpec,
    tracked: Vec<Tracked>,
    phase: PreparerPhase,
}

impl PreparerChain {
    pub fn new(spec: PreparerSpec) -> Self {
        Self {
            spec,
            tracked: Vec::new(),
            phase: PreparerPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> PreparerPhase {
        self.phase
    }

    /// Names of the preparers teardown would visit, in setup order.
    pub fn tracked(&self) -> Vec<&str> {
        self.tracked.iter().map(|t| t.preparer.name()).collect()
    }

    /// Run every enabled preparer's `set_up`, stopping at the first error.
    pub async fn set_up(&mut self, info: &TestInformation, sink: &mut dyn ResultSink) -> Result<()> {
        let slots: Vec<String> = info.context().slot_names().map(str::to_string).collect();
        if let Some((slot, _)) = self
            .spec
            .device_chains
            .iter()
            .find(|(name, _)| !slots.contains(name))
        {
            return Err(InvocationError::Config(format!(
                "preparers configured for unknown device slot {slot}"
            )));
        }

        self.phase = PreparerPhase::HostPreSetup;
        for preparer in self.spec.multi_pre_target.clone() {
            self.run_set_up(preparer, Scope::HostPre, info, sink).await?;
        }

        self.phase = PreparerPhase::DeviceSetup;
        for (index, slot) in slots.iter().enumerate() {
            let Some(chain) = self.spec.chain_for(slot).map(<[_]>::to_vec) else {
                continue;
            };
            info.set_active_device(index);
            for preparer in chain {
                self.run_set_up(preparer, Scope::Device(index), info, sink).await?;
            }
        }
        info.set_active_device(0);

        self.phase = PreparerPhase::HostPostSetup;
        for preparer in self.spec.multi_target.clone() {
            self.run_set_up(preparer, Scope::HostPost, info, sink).await?;
        }

        self.phase = PreparerPhase::Running;
        Ok(())
    }

    async fn run_set_up(
        &mut self,
        preparer: Arc<dyn Preparer>,
        scope: Scope,
        info: &TestInformation,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        if preparer.is_disabled() {
            tracing::debug!(preparer = %preparer.name(), "skipping disabled preparer");
            return Ok(());
        }
        self.tracked.push(Tracked {
            preparer: Arc::clone(&preparer),
            scope,
        });
        tracing::debug!(preparer = %preparer.name(), "set_up");
        let result = preparer.set_up(info).await;
        forward_logs(preparer.as_ref(), sink);
        result
    }

    /// Tear down every tracked preparer in reverse order.
    ///
    /// `cause` is handed unchanged to every `tear_down`. Errors do not stop
    /// the pass; the first one is returned afterwards. The tracked list is
    /// drained, so calling this again does nothing.
    pub async fn tear_down(
        &mut self,
        info: &TestInformation,
        cause: Option<&InvocationError>,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        let tracked = std::mem::take(&mut self.tracked);
        let mut errors = Vec::new();

        for Tracked { preparer, scope } in tracked.into_iter().rev() {
            self.phase = scope.teardown_phase();
            if preparer.is_disabled() || preparer.is_tear_down_disabled() {
                tracing::debug!(preparer = %preparer.name(), "tear down disabled");
                continue;
            }
            if let Scope::Device(index) = scope {
                info.set_active_device(index);
            }
            if let Err(err) = preparer.tear_down(info, cause).await {
                obs::emit_teardown_error(preparer.name(), &err);
                errors.push(err);
            }
            forward_logs(preparer.as_ref(), sink);
        }
        info.set_active_device(0);
        self.phase = PreparerPhase::Done;

        let suppressed = errors.len().saturating_sub(1);
        match errors.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(InvocationError::TearDown {
                first: Box::new(first),
                trigger: cause.cloned().map(Box::new),
                suppressed,
            }),
        }
    }
}

/// Hand logs captured by a preparer to the sink.
fn forward_logs(preparer: &dyn Preparer, sink: &mut dyn ResultSink) {
    if let Some(source) = preparer.as_log_source() {
        for log in source.drain_logs() {
            sink.test_log(&log.name, log.data_type, &log.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoker_domain::fakes::{seq, CallLog, FakeDevice, FakePreparer, RecordingSink};
    use invoker_domain::InvocationContext;

    fn info() -> TestInformation {
        let ctx = InvocationContext::new("stub")
            .with_device("device1", Arc::new(FakeDevice::new("serial-1")))
            .with_device("device2", Arc::new(FakeDevice::new("serial-2")));
        TestInformation::new(ctx).expect("info")
    }

    fn preparer(name: &str, log: &CallLog) -> Arc<dyn Preparer> {
        Arc::new(FakePreparer::new(name, log.clone()))
    }

    #[tokio::test]
    async fn test_setup_order_and_reverse_teardown() {
        let log = CallLog::new();
        let mut spec = PreparerSpec::default();
        spec.multi_pre_target.push(preparer("pre", &log));
        spec.add_device_preparer("device2", preparer("d2", &log));
        spec.add_device_preparer("device1", preparer("d1", &log));
        spec.multi_target.push(preparer("post", &log));
        let mut chain = PreparerChain::new(spec);
        let info = info();
        let mut sink = RecordingSink::new("sink");

        chain.set_up(&info, &mut sink).await.expect("set_up");
        assert_eq!(chain.phase(), PreparerPhase::Running);
        chain.tear_down(&info, None, &mut sink).await.expect("tear_down");
        assert_eq!(chain.phase(), PreparerPhase::Done);

        assert_eq!(
            log.sequence(),
            seq(&[
                ("pre", "set_up"),
                ("d1", "set_up"),
                ("d2", "set_up"),
                ("post", "set_up"),
                ("post", "tear_down"),
                ("d2", "tear_down"),
                ("d1", "tear_down"),
                ("pre", "tear_down"),
            ])
        );
        assert_eq!(log.details_of("d2", "set_up"), vec![Some("serial-2".to_string())]);
    }

    #[tokio::test]
    async fn test_setup_failure_tears_down_only_started_preparers() {
        let log = CallLog::new();
        let cause = InvocationError::target_setup("flash failed", Some("serial-1".to_string()));
        let mut spec = PreparerSpec::default();
        spec.multi_pre_target = vec![
            preparer("p1", &log),
            Arc::new(FakePreparer::new("p2", log.clone()).failing_set_up(cause.clone())),
            preparer("p3", &log),
            preparer("p4", &log),
        ];
        let mut chain = PreparerChain::new(spec);
        let info = info();
        let mut sink = RecordingSink::new("sink");

        let err = chain.set_up(&info, &mut sink).await.unwrap_err();
        assert_eq!(err, cause);
        chain
            .tear_down(&info, Some(&err), &mut sink)
            .await
            .expect("tear_down");

        assert_eq!(log.components_in("tear_down"), vec!["p2", "p1"]);
        assert_eq!(log.count("p3", "set_up") + log.count("p4", "set_up"), 0);
        assert_eq!(
            log.details_of("p1", "tear_down"),
            vec![Some(cause.to_string())]
        );
    }

    #[tokio::test]
    async fn test_teardown_errors_collected_and_cause_kept() {
        let log = CallLog::new();
        let mut spec = PreparerSpec::default();
        spec.multi_pre_target = vec![
            Arc::new(FakePreparer::new("p1", log.clone()).failing_tear_down(InvocationError::runtime("p1 broke"))),
            preparer("p2", &log),
            Arc::new(FakePreparer::new("p3", log.clone()).failing_tear_down(InvocationError::runtime("p3 broke"))),
        ];
        let mut chain = PreparerChain::new(spec);
        let info = info();
        let mut sink = RecordingSink::new("sink");
        chain.set_up(&info, &mut sink).await.expect("set_up");

        let cause = InvocationError::runtime("test crashed");
        let err = chain
            .tear_down(&info, Some(&cause), &mut sink)
            .await
            .unwrap_err();

        assert_eq!(log.components_in("tear_down"), vec!["p3", "p2", "p1"]);
        for name in ["p1", "p2", "p3"] {
            assert_eq!(log.details_of(name, "tear_down"), vec![Some("test crashed".to_string())]);
        }
        match err {
            InvocationError::TearDown {
                first,
                trigger,
                suppressed,
            } => {
                assert_eq!(*first, InvocationError::runtime("p3 broke"));
                assert_eq!(trigger.as_deref(), Some(&cause));
                assert_eq!(suppressed, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disable_flags_and_second_teardown_is_noop() {
        let log = CallLog::new();
        let mut spec = PreparerSpec::default();
        spec.multi_pre_target = vec![
            Arc::new(FakePreparer::new("off", log.clone()).disabled()),
            Arc::new(FakePreparer::new("keep", log.clone()).tear_down_disabled()),
            preparer("normal", &log),
        ];
        let mut chain = PreparerChain::new(spec);
        let info = info();
        let mut sink = RecordingSink::new("sink");

        chain.set_up(&info, &mut sink).await.expect("set_up");
        chain.tear_down(&info, None, &mut sink).await.expect("tear_down");
        chain.tear_down(&info, None, &mut sink).await.expect("second tear_down");

        assert!(log.phases_of("off").is_empty());
        assert_eq!(log.phases_of("keep"), vec!["set_up"]);
        assert_eq!(log.phases_of("normal"), vec!["set_up", "tear_down"]);
    }

    #[tokio::test]
    async fn test_captured_logs_reach_sink() {
        let log = CallLog::new();
        let mut spec = PreparerSpec::default();
        spec.multi_target
            .push(Arc::new(FakePreparer::new("logger", log.clone()).capturing_logs()));
        let mut chain = PreparerChain::new(spec);
        let info = info();
        let mut sink = RecordingSink::new("sink");
        let recording = sink.recording();

        chain.set_up(&info, &mut sink).await.expect("set_up");
        chain.tear_down(&info, None, &mut sink).await.expect("tear_down");

        assert_eq!(
            recording.labels(),
            vec!["test_log:logger-set_up", "test_log:logger-tear_down"]
        );
    }

    #[tokio::test]
    async fn test_unknown_slot_rejected_before_any_setup() {
        let log = CallLog::new();
        let mut spec = PreparerSpec::default();
        spec.multi_pre_target.push(preparer("pre", &log));
        spec.add_device_preparer("device9", preparer("d9", &log));
        let mut chain = PreparerChain::new(spec);
        let mut sink = RecordingSink::new("sink");

        let err = chain.set_up(&info(), &mut sink).await.unwrap_err();
        assert!(matches!(err, InvocationError::Config(_)));
        assert!(log.calls().is_empty());
    }
}
