//! Splitting an invocation into shards and merging their results.
//!
//! The parent splits its shardable tests, gives every shard deep-cloned
//! builds and a [`ShardListener`], and hands each shard to a
//! [`Rescheduler`]. It does not wait for them. Shard listeners replay into
//! one shared [`ShardMainForwarder`], which ends the merged stream once
//! every shard ended or was cancelled.

use std::sync::Arc;
use std::time::Duration;

use invoker_domain::{
    BuildProvider, BuildRecord, FailureDescription, FailureStatus, InvocationContext, LogData,
    LogDataType, LogFile, ModuleContext, RemoteTest, Result, ResultSink, RunMetrics,
    ShardDescriptor, Summary, TestDescription, TestInformation,
};

use crate::config::CommandOptions;
use crate::fetch::FetchedBuilds;
use crate::forwarder::SharedSink;
use crate::log_tracker::ShardListener;

/// Accepts shards for execution somewhere else.
pub trait Rescheduler: Send + Sync {
    /// `false` means the shard was rejected and will never run.
    fn schedule_config(&self, shard: ShardInvocation) -> bool;
}

/// A deep-cloned build of one slot and the provider that releases it.
pub struct ShardBuild {
    pub slot: String,
    pub record: BuildRecord,
    pub provider: Arc<dyn BuildProvider>,
}

/// Everything one shard needs to run as an invocation of its own.
pub struct ShardInvocation {
    pub descriptor: ShardDescriptor,
    pub info: TestInformation,
    pub tests: Vec<Arc<dyn RemoteTest>>,
    pub builds: Vec<ShardBuild>,
    pub listener: ShardListener,
    pub options: CommandOptions,
    pub command_line: Vec<String>,
}

impl std::fmt::Debug for ShardInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardInvocation")
            .field("descriptor", &self.descriptor)
            .field("tests", &self.tests.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field(
                "builds",
                &self.builds.iter().map(|b| &b.record.build_id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug)]
pub struct ShardPlan {
    pub shards: Vec<ShardInvocation>,
}

impl ShardPlan {
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ShardCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ShardCoordinator {
    shard_count: usize,
}

impl ShardCoordinator {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Distribute `tests` over the shards.
    ///
    /// Shardable tests are split into pieces, other tests stay whole.
    /// Pieces go round-robin over the shards, so some shards may stay empty.
    /// Returns `None` when no test split, in which case the invocation runs
    /// inline.
    pub fn split(
        &self,
        tests: &[Arc<dyn RemoteTest>],
        info: &TestInformation,
    ) -> Option<Vec<Vec<Arc<dyn RemoteTest>>>> {
        if self.shard_count < 2 {
            return None;
        }
        let mut any_split = false;
        let mut pieces: Vec<Arc<dyn RemoteTest>> = Vec::new();
        for test in tests {
            let split = test
                .as_shardable()
                .and_then(|s| s.split(Some(self.shard_count), info))
                .filter(|p| p.len() > 1);
            match split {
                Some(split) => {
                    tracing::debug!(test = %test.name(), pieces = split.len(), "split test");
                    any_split = true;
                    pieces.extend(split);
                }
                None => pieces.push(Arc::clone(test)),
            }
        }
        if !any_split {
            return None;
        }

        let mut shards: Vec<Vec<Arc<dyn RemoteTest>>> = vec![Vec::new(); self.shard_count];
        for (index, piece) in pieces.into_iter().enumerate() {
            shards[index % self.shard_count].push(piece);
        }
        Some(shards)
    }

    /// Turn an assignment from [`ShardCoordinator::split`] into shard
    /// invocations.
    ///
    /// Builds are deep-cloned under `<dependencies>/shard-<i>/<slot>` so each
    /// shard releases its own copy; the parent's records are untouched.
    pub fn plan(
        &self,
        assignment: Vec<Vec<Arc<dyn RemoteTest>>>,
        info: &TestInformation,
        builds: &FetchedBuilds,
        options: &CommandOptions,
        command_line: &[String],
        main: &SharedSink<ShardMainForwarder>,
    ) -> Result<ShardPlan> {
        let count = assignment.len();
        let parent = info.context().invocation_id();
        let mut shards = Vec::with_capacity(count);

        for (index, tests) in assignment.into_iter().enumerate() {
            let descriptor = ShardDescriptor {
                index,
                count,
                parent,
            };
            let dir = info.dependencies_dir().join(format!("shard-{index}"));
            let mut shard_builds = Vec::with_capacity(builds.len());
            for entry in builds.entries() {
                shard_builds.push(ShardBuild {
                    slot: entry.slot.clone(),
                    record: entry.record.deep_clone(&dir.join(&entry.slot))?,
                    provider: Arc::clone(&entry.provider),
                });
            }

            let mut shard_options = options.clone();
            shard_options.shard_count = Some(count);
            shard_options.shard_index = Some(index);

            shards.push(ShardInvocation {
                descriptor,
                info: info.for_shard(descriptor),
                tests,
                builds: shard_builds,
                listener: ShardListener::new(main.clone()),
                options: shard_options,
                command_line: command_line.to_vec(),
            });
        }
        Ok(ShardPlan { shards })
    }

    /// Hand every shard to `rescheduler`. A rejected shard is cancelled on
    /// `main` so the merged stream still ends. Returns how many were accepted.
    pub fn schedule(
        &self,
        plan: ShardPlan,
        rescheduler: &dyn Rescheduler,
        main: &SharedSink<ShardMainForwarder>,
    ) -> usize {
        let mut scheduled = 0;
        for shard in plan.shards {
            let index = shard.descriptor.index;
            if rescheduler.schedule_config(shard) {
                scheduled += 1;
            } else {
                tracing::warn!(shard = index, "rescheduler rejected shard");
                main.lock().cancel_shard(index);
            }
        }
        scheduled
    }
}

// ---------------------------------------------------------------------------
// ShardMainForwarder
// ---------------------------------------------------------------------------

/// Merges the streams of every shard into the parent's listeners.
///
/// `invocation_started` reaches the listeners once. Shard failures are
/// joined into a single `invocation_failed`, reported right before the one
/// `invocation_ended` that follows the last shard.
pub struct ShardMainForwarder {
    inner: SharedSink,
    expected: usize,
    finished: usize,
    started: bool,
    ended: bool,
    failures: Vec<FailureDescription>,
    elapsed: Duration,
}

impl ShardMainForwarder {
    pub fn new(inner: SharedSink, expected: usize) -> Self {
        Self {
            inner,
            expected,
            finished: 0,
            started: false,
            ended: false,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// The parent already reported `invocation_started` itself.
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn is_complete(&self) -> bool {
        self.ended
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    /// Count shard `index` as ended without it ever running.
    pub fn cancel_shard(&mut self, index: usize) {
        self.failures.push(
            FailureDescription::new(format!("shard {index} was not scheduled"))
                .with_status(FailureStatus::Cancelled),
        );
        self.shard_ended(Duration::ZERO);
    }

    fn shard_ended(&mut self, elapsed: Duration) {
        if self.ended {
            return;
        }
        self.finished += 1;
        self.elapsed = self.elapsed.max(elapsed);
        if self.finished < self.expected {
            return;
        }
        self.ended = true;
        if let Some(failure) = FailureDescription::join(std::mem::take(&mut self.failures)) {
            self.inner.invocation_failed(&failure);
        }
        tracing::info!(event = "shard.merged", shards = self.expected, "all shards ended");
        self.inner.invocation_ended(self.elapsed);
    }
}

impl ResultSink for ShardMainForwarder {
    fn invocation_started(&mut self, context: &InvocationContext) {
        if !self.started {
            self.started = true;
            self.inner.invocation_started(context);
        }
    }

    fn invocation_failed(&mut self, failure: &FailureDescription) {
        self.failures.push(failure.clone());
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        self.shard_ended(elapsed);
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

    fn summaries(&self) -> Vec<Summary> {
        self.inner.summaries()
    }
}
