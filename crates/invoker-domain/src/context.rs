//! Invocation context: device slots, their builds, and invocation attributes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::build::BuildRecord;
use crate::device::{Device, RecoveryMode};
use crate::error::{InvocationError, Result};

/// Name of the single slot used when a configuration declares no devices.
pub const DEFAULT_SLOT: &str = "default";

/// Position of a shard inside its parent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub index: usize,
    pub count: usize,
    pub parent: Uuid,
}

/// One allocated device and the build fetched for it.
#[derive(Clone)]
pub struct DeviceSlot {
    pub name: String,
    pub device: Arc<dyn Device>,
    pub build: Option<BuildRecord>,
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("name", &self.name)
            .field("serial", &self.device.serial())
            .field("build", &self.build.as_ref().map(|b| &b.build_id))
            .finish()
    }
}

/// Multi-valued string attributes; once locked, additions are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, Vec<String>>,
    locked: bool,
}

impl Attributes {
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if self.locked {
            return Err(InvocationError::AttributesLocked { key });
        }
        self.values.entry(key).or_default().push(value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(String::as_str)
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Identity of one invocation.
///
/// Created once per invocation, filled in by the fetch and setup phases, and
/// still readable by reporting after a failure.
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: Uuid,
    test_tag: String,
    slots: Vec<DeviceSlot>,
    attributes: Attributes,
    shard: Option<ShardDescriptor>,
    invocation_metrics: BTreeMap<String, String>,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("test_tag", &self.test_tag)
            .field("slots", &self.slots)
            .field("shard", &self.shard)
            .finish()
    }
}

impl InvocationContext {
    pub fn new(test_tag: impl Into<String>) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            test_tag: test_tag.into(),
            slots: Vec::new(),
            attributes: Attributes::default(),
            shard: None,
            invocation_metrics: BTreeMap::new(),
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn test_tag(&self) -> &str {
        &self.test_tag
    }

    pub fn set_test_tag(&mut self, tag: impl Into<String>) {
        self.test_tag = tag.into();
    }

    /// Register a device under a slot name. Slot order is registration order.
    pub fn add_device(&mut self, name: impl Into<String>, device: Arc<dyn Device>) {
        self.slots.push(DeviceSlot {
            name: name.into(),
            device,
            build: None,
        });
    }

    pub fn with_device(mut self, name: impl Into<String>, device: Arc<dyn Device>) -> Self {
        self.add_device(name, device);
        self
    }

    pub fn slots(&self) -> &[DeviceSlot] {
        &self.slots
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn Device>> {
        self.slots.iter().map(|s| &s.device)
    }

    pub fn device(&self, name: &str) -> Option<&Arc<dyn Device>> {
        self.slots.iter().find(|s| s.name == name).map(|s| &s.device)
    }

    pub fn device_at(&self, index: usize) -> Option<&Arc<dyn Device>> {
        self.slots.get(index).map(|s| &s.device)
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<&Arc<dyn Device>> {
        self.devices().find(|d| d.serial() == serial)
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices().map(|d| d.serial()).collect()
    }

    pub fn build(&self, slot: &str) -> Option<&BuildRecord> {
        self.slots
            .iter()
            .find(|s| s.name == slot)
            .and_then(|s| s.build.as_ref())
    }

    pub fn builds(&self) -> impl Iterator<Item = (&str, &BuildRecord)> {
        self.slots
            .iter()
            .filter_map(|s| s.build.as_ref().map(|b| (s.name.as_str(), b)))
    }

    pub fn set_build(&mut self, slot: &str, build: BuildRecord) -> Result<()> {
        let entry = self
            .slots
            .iter_mut()
            .find(|s| s.name == slot)
            .ok_or_else(|| InvocationError::Config(format!("unknown device slot {slot}")))?;
        entry.build = Some(build);
        Ok(())
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.attributes.add(key, value)
    }

    pub fn lock_attributes(&mut self) {
        self.attributes.lock();
    }

    pub fn shard(&self) -> Option<&ShardDescriptor> {
        self.shard.as_ref()
    }

    /// Derive the context of one shard: fresh id, same tag and attributes,
    /// no devices (the shard allocates its own).
    pub fn for_shard(&self, shard: ShardDescriptor) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.locked = false;
        Self {
            invocation_id: Uuid::new_v4(),
            test_tag: self.test_tag.clone(),
            slots: Vec::new(),
            attributes,
            shard: Some(shard),
            invocation_metrics: BTreeMap::new(),
        }
    }

    /// Downgrade recovery on every device.
    pub fn set_recovery_mode_for_all(&self, mode: RecoveryMode) {
        for device in self.devices() {
            device.set_recovery_mode(mode);
        }
    }

    pub fn invocation_metrics(&self) -> &BTreeMap<String, String> {
        &self.invocation_metrics
    }

    /// Record end-of-invocation metrics; allowed even after attributes are locked.
    pub fn record_invocation_metrics(&mut self, metrics: impl IntoIterator<Item = (String, String)>) {
        self.invocation_metrics.extend(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeDevice;

    #[test]
    fn test_locked_attributes_reject_additions() {
        let mut ctx = InvocationContext::new("stub");
        ctx.add_attribute("branch", "main").expect("add before lock");
        ctx.lock_attributes();

        let err = ctx.add_attribute("late", "value").unwrap_err();
        assert_eq!(
            err,
            InvocationError::AttributesLocked {
                key: "late".to_string()
            }
        );
        assert_eq!(ctx.attributes().first("branch"), Some("main"));
    }

    #[test]
    fn test_slots_keep_registration_order() {
        let ctx = InvocationContext::new("stub")
            .with_device("device2", Arc::new(FakeDevice::new("serial-2")))
            .with_device("device1", Arc::new(FakeDevice::new("serial-1")));

        assert_eq!(ctx.slot_names().collect::<Vec<_>>(), vec!["device2", "device1"]);
        assert_eq!(ctx.serials(), vec!["serial-2", "serial-1"]);
        assert!(ctx.device_by_serial("serial-1").is_some());
    }

    #[test]
    fn test_set_build_unknown_slot() {
        let mut ctx = InvocationContext::new("stub");
        assert!(matches!(
            ctx.set_build("missing", BuildRecord::new("1")),
            Err(InvocationError::Config(_))
        ));
    }

    #[test]
    fn test_for_shard_keeps_tag_and_unlocks() {
        let mut ctx = InvocationContext::new("suite");
        ctx.add_attribute("k", "v").expect("add");
        ctx.lock_attributes();
        let shard = ShardDescriptor {
            index: 1,
            count: 2,
            parent: ctx.invocation_id(),
        };
        let child = ctx.for_shard(shard);

        assert_ne!(child.invocation_id(), ctx.invocation_id());
        assert_eq!(child.test_tag(), "suite");
        assert_eq!(child.shard(), Some(&shard));
        assert!(!child.attributes().is_locked());
        assert_eq!(child.attributes().first("k"), Some("v"));
        assert_eq!(child.slots().len(), 0);
    }
}
