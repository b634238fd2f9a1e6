//! Per-attempt test information handed to preparers and test runnables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tempfile::TempDir;

use crate::context::{InvocationContext, ShardDescriptor};
use crate::device::Device;
use crate::error::Result;

/// Scratch map shared between preparers and tests of one attempt.
#[derive(Debug, Default)]
pub struct ScratchMap<V> {
    inner: RwLock<BTreeMap<String, V>>,
}

impl<V: Clone> ScratchMap<V> {
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The invocation context plus scratch state for one attempt or shard.
///
/// The dependencies folder is reference counted: shards derived from this
/// information keep it alive until the last of them is dropped.
pub struct TestInformation {
    context: InvocationContext,
    work_dir: Arc<TempDir>,
    execution_files: ScratchMap<PathBuf>,
    properties: ScratchMap<String>,
    active_device: AtomicUsize,
}

impl std::fmt::Debug for TestInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestInformation")
            .field("context", &self.context)
            .field("work_dir", &self.work_dir.path())
            .field("active_device", &self.active_device.load(Ordering::Relaxed))
            .finish()
    }
}

impl TestInformation {
    pub fn new(context: InvocationContext) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("invoker-workfolder-")
            .tempdir()?;
        Ok(Self::with_work_dir(context, Arc::new(work_dir)))
    }

    fn with_work_dir(context: InvocationContext, work_dir: Arc<TempDir>) -> Self {
        Self {
            context,
            work_dir,
            execution_files: ScratchMap::default(),
            properties: ScratchMap::default(),
            active_device: AtomicUsize::new(0),
        }
    }

    /// Information for one shard: a derived context sharing this work folder
    /// and a copy of the execution files known so far.
    pub fn for_shard(&self, shard: ShardDescriptor) -> Self {
        let info = Self::with_work_dir(self.context.for_shard(shard), Arc::clone(&self.work_dir));
        for (key, path) in self.execution_files.snapshot() {
            info.execution_files.put(key, path);
        }
        for (key, value) in self.properties.snapshot() {
            info.properties.put(key, value);
        }
        info
    }

    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut InvocationContext {
        &mut self.context
    }

    pub fn dependencies_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn execution_files(&self) -> &ScratchMap<PathBuf> {
        &self.execution_files
    }

    pub fn properties(&self) -> &ScratchMap<String> {
        &self.properties
    }

    /// Select which device slot device-scope preparers act on.
    pub fn set_active_device(&self, index: usize) {
        self.active_device.store(index, Ordering::Relaxed);
    }

    pub fn active_device_index(&self) -> usize {
        self.active_device.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.context.device_at(self.active_device_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeDevice;
    use uuid::Uuid;

    #[test]
    fn test_active_device_switches_slot() {
        let ctx = InvocationContext::new("stub")
            .with_device("default", Arc::new(FakeDevice::new("serial-0")))
            .with_device("device1", Arc::new(FakeDevice::new("serial-1")));
        let info = TestInformation::new(ctx).expect("test info");

        assert_eq!(info.device().map(|d| d.serial()), Some("serial-0".to_string()));
        info.set_active_device(1);
        assert_eq!(info.device().map(|d| d.serial()), Some("serial-1".to_string()));
    }

    #[test]
    fn test_shard_keeps_work_dir_alive() {
        let info = TestInformation::new(InvocationContext::new("stub")).expect("test info");
        info.execution_files().put("suite", info.dependencies_dir().join("suite.zip"));
        let dir = info.dependencies_dir().to_path_buf();

        let shard = info.for_shard(ShardDescriptor {
            index: 0,
            count: 2,
            parent: Uuid::new_v4(),
        });
        drop(info);

        assert!(dir.exists());
        assert_eq!(shard.dependencies_dir(), dir.as_path());
        assert_eq!(shard.execution_files().get("suite"), Some(dir.join("suite.zip")));
        drop(shard);
        assert!(!dir.exists());
    }
}
