//! Rescheduler running every shard as its own invocation on the tokio runtime.
//!
//! The parent never waits on its shards. [`TokioRescheduler::wait_all`] is
//! for callers (and tests) that want to know when every scheduled shard
//! finished.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use invoker_domain::{
    BuildProvider, Device, InvocationError, LogSaver, MetricCollector, PostProcessor, Result,
    ShardDescriptor, TestInformation,
};

use crate::config::InvocationConfig;
use crate::executor::{InvocationExecutor, InvocationOutcome};
use crate::fetch::ExistingBuildProvider;
use crate::preparer::PreparerSpec;
use crate::shard::{Rescheduler, ShardInvocation};

/// Per-shard resources a shard cannot share with its parent.
#[derive(Default)]
pub struct ShardResources {
    /// `(slot, device)` in slot order.
    pub devices: Vec<(String, Arc<dyn Device>)>,
    pub preparers: PreparerSpec,
    pub collectors: Vec<Box<dyn MetricCollector>>,
    pub post_processors: Vec<Box<dyn PostProcessor>>,
    /// Logs stay in memory when unset.
    pub log_saver: Option<Box<dyn LogSaver>>,
}

/// Allocates devices and fresh collaborators for one shard.
pub trait ShardResourceFactory: Send + Sync {
    fn resources(&self, shard: &ShardDescriptor, slots: &[String]) -> Result<ShardResources>;
}

pub struct TokioRescheduler {
    factory: Arc<dyn ShardResourceFactory>,
    tasks: Mutex<Vec<(usize, JoinHandle<Result<InvocationOutcome>>)>>,
}

impl TokioRescheduler {
    pub fn new(factory: Arc<dyn ShardResourceFactory>) -> Self {
        Self {
            factory,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of shards spawned and not yet waited on.
    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait for every shard spawned so far, in scheduling order.
    pub async fn wait_all(&self) -> Vec<Result<InvocationOutcome>> {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        join_all(tasks.into_iter().map(|(index, task)| async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(InvocationError::runtime(format!("shard {index} task failed: {err}"))),
            }
        }))
        .await
    }

    fn prepare(&self, shard: ShardInvocation) -> Result<(InvocationExecutor, TestInformation)> {
        let ShardInvocation {
            descriptor,
            mut info,
            tests,
            builds,
            listener,
            options,
            command_line,
        } = shard;

        let slots: Vec<String> = builds.iter().map(|b| b.slot.clone()).collect();
        let resources = self.factory.resources(&descriptor, &slots)?;
        for (slot, device) in resources.devices {
            info.context_mut().add_device(slot, device);
        }

        let mut builder = InvocationConfig::builder()
            .options(options)
            .command_line(command_line)
            .preparers(resources.preparers)
            .tests(tests)
            .listener(Box::new(listener));
        for build in builds {
            let provider: Arc<dyn BuildProvider> =
                Arc::new(ExistingBuildProvider::new(build.record, build.provider));
            builder = builder.build_provider(&build.slot, provider);
        }
        for collector in resources.collectors {
            builder = builder.collector(collector);
        }
        for processor in resources.post_processors {
            builder = builder.post_processor(processor);
        }
        if let Some(saver) = resources.log_saver {
            builder = builder.log_saver(saver);
        }

        Ok((InvocationExecutor::new(builder.build()?), info))
    }
}

impl Rescheduler for TokioRescheduler {
    fn schedule_config(&self, shard: ShardInvocation) -> bool {
        let index = shard.descriptor.index;
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(shard = index, error = %err, "no tokio runtime to run shard on");
                return false;
            }
        };
        let (executor, info) = match self.prepare(shard) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(shard = index, error = %err, "could not allocate shard resources");
                return false;
            }
        };

        debug!(shard = index, "spawning shard invocation");
        let task = runtime.spawn(async move {
            let result = executor.invoke_with_information(info).await;
            match &result {
                Ok(outcome) => info!(shard = index, success = outcome.success, "shard finished"),
                Err(err) => warn!(shard = index, error = %err, "shard finished with error"),
            }
            result
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index, task));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandOptions;
    use crate::fetch::FetchedBuilds;
    use crate::forwarder::{ResultForwarder, SharedSink};
    use crate::shard::{ShardCoordinator, ShardMainForwarder};
    use invoker_domain::fakes::{
        CallLog, FakeBuildProvider, FakeDevice, RecordingSink, StubShardableTest,
    };
    use invoker_domain::{BuildRecord, InvocationContext, RemoteTest};

    struct FakeDevices {
        log: CallLog,
        fail: bool,
    }

    impl ShardResourceFactory for FakeDevices {
        fn resources(&self, shard: &ShardDescriptor, slots: &[String]) -> Result<ShardResources> {
            if self.fail {
                return Err(InvocationError::Config("no devices left".to_string()));
            }
            let devices = slots
                .iter()
                .map(|slot| {
                    let device = FakeDevice::new(&format!("shard{}-{slot}", shard.index))
                        .with_log(self.log.clone());
                    (slot.clone(), Arc::new(device) as Arc<dyn Device>)
                })
                .collect();
            Ok(ShardResources {
                devices,
                ..Default::default()
            })
        }
    }

    fn plan_two_shards(
        log: &CallLog,
        provider: Arc<FakeBuildProvider>,
        main: &SharedSink<ShardMainForwarder>,
    ) -> (ShardCoordinator, crate::shard::ShardPlan) {
        let info = TestInformation::new(InvocationContext::new("suite")).expect("info");
        let mut builds = FetchedBuilds::new();
        builds.push("default", provider, BuildRecord::new("100"));
        let coordinator = ShardCoordinator::new(2);
        let test: Arc<dyn RemoteTest> = Arc::new(StubShardableTest::new("suite", 2, log.clone()));
        let assignment = coordinator.split(&[test], &info).expect("split");
        let plan = coordinator
            .plan(assignment, &info, &builds, &CommandOptions::default(), &[], main)
            .expect("plan");
        (coordinator, plan)
    }

    #[tokio::test]
    async fn test_shards_run_and_merge_into_main() {
        let log = CallLog::new();
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let listeners = SharedSink::new(ResultForwarder::new(vec![Box::new(sink)])).erase();
        let main = SharedSink::new(ShardMainForwarder::new(listeners, 2));
        let provider = Arc::new(FakeBuildProvider::returning("p1", "100", log.clone()));

        let (coordinator, plan) = plan_two_shards(&log, provider.clone(), &main);
        let rescheduler = TokioRescheduler::new(Arc::new(FakeDevices {
            log: log.clone(),
            fail: false,
        }));
        assert_eq!(coordinator.schedule(plan, &rescheduler, &main), 2);
        assert_eq!(rescheduler.pending(), 2);

        let outcomes = rescheduler.wait_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.as_ref().is_ok_and(|o| o.success)));
        assert!(main.lock().is_complete());

        let labels = recording.labels();
        assert_eq!(labels.iter().filter(|l| *l == "invocation_started").count(), 1);
        assert_eq!(labels.iter().filter(|l| *l == "invocation_ended").count(), 1);
        assert_eq!(labels.last().map(String::as_str), Some("invocation_ended"));
        assert_eq!(recording.run_starts().len(), 2);

        // Each shard released its own clone through the parent's provider.
        assert_eq!(provider.cleaned_builds().len(), 2);
        assert_eq!(log.count("shard0-default", "pre_invocation_setup"), 1);
        assert_eq!(log.count("shard1-default", "post_invocation_tear_down"), 1);
    }

    #[tokio::test]
    async fn test_failed_allocation_rejects_and_cancels() {
        let log = CallLog::new();
        let sink = RecordingSink::new("terminal");
        let recording = sink.recording();
        let listeners = SharedSink::new(ResultForwarder::new(vec![Box::new(sink)])).erase();
        let main = SharedSink::new(ShardMainForwarder::new(listeners, 2));
        let provider = Arc::new(FakeBuildProvider::returning("p1", "100", log.clone()));

        let (coordinator, plan) = plan_two_shards(&log, provider, &main);
        let rescheduler = TokioRescheduler::new(Arc::new(FakeDevices { log, fail: true }));

        assert_eq!(coordinator.schedule(plan, &rescheduler, &main), 0);
        assert_eq!(rescheduler.pending(), 0);
        assert!(main.lock().is_complete());
        let failures = recording.invocation_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].related.len(), 2);
    }
}
