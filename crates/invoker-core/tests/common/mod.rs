//! Shared fixtures for the executor integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use invoker_core::{InvocationConfig, InvocationConfigBuilder, ShardResourceFactory, ShardResources};
use invoker_domain::fakes::{CallLog, FakeBuildProvider, FakeDevice, RecordingSink, SinkRecording};
use invoker_domain::{Device, InvocationContext, InvocationError, Result, ShardDescriptor, DEFAULT_SLOT};

/// A device logging into `log`, with a logcat and bugreports.
pub fn device(serial: &str, log: &CallLog) -> Arc<FakeDevice> {
    Arc::new(
        FakeDevice::new(serial)
            .with_log(log.clone())
            .with_logcat(&format!("logcat of {serial}"))
            .with_bugreports(),
    )
}

/// Context with one device in the default slot.
pub fn single_device_context(serial: &str, log: &CallLog) -> InvocationContext {
    InvocationContext::new("suite").with_device(DEFAULT_SLOT, device(serial, log) as Arc<dyn Device>)
}

pub fn provider(name: &str, build_id: &str, log: &CallLog) -> Arc<FakeBuildProvider> {
    Arc::new(FakeBuildProvider::returning(name, build_id, log.clone()))
}

pub fn listener(name: &str) -> (Box<RecordingSink>, SinkRecording) {
    let sink = RecordingSink::new(name);
    let recording = sink.recording();
    (Box::new(sink), recording)
}

/// Builder with a provider for the default slot and one recording listener.
pub fn base_config(log: &CallLog) -> (InvocationConfigBuilder, Arc<FakeBuildProvider>, SinkRecording) {
    let provider = provider("provider", "1000", log);
    let (sink, recording) = listener("terminal");
    let builder = InvocationConfig::builder()
        .build_provider(DEFAULT_SLOT, provider.clone())
        .listener(sink);
    (builder, provider, recording)
}

pub fn position(labels: &[String], label: &str) -> usize {
    labels
        .iter()
        .position(|l| l == label)
        .unwrap_or_else(|| panic!("missing {label} in {labels:?}"))
}

pub fn count(labels: &[String], label: &str) -> usize {
    labels.iter().filter(|l| *l == label).count()
}

/// Hands every shard fresh fake devices named `shard<i>-<slot>`.
pub struct FakeShardDevices {
    pub log: CallLog,
    pub fail: bool,
}

impl ShardResourceFactory for FakeShardDevices {
    fn resources(&self, shard: &ShardDescriptor, slots: &[String]) -> Result<ShardResources> {
        if self.fail {
            return Err(InvocationError::Config("device pool exhausted".to_string()));
        }
        let devices = slots
            .iter()
            .map(|slot| {
                let serial = format!("shard{}-{slot}", shard.index);
                (slot.clone(), device(&serial, &self.log) as Arc<dyn Device>)
            })
            .collect();
        Ok(ShardResources {
            devices,
            ..Default::default()
        })
    }
}
