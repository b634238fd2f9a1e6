//! Build records fetched for each device slot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Build attribute holding the original command line of the invocation.
pub const COMMAND_ARGS_KEY: &str = "command_line_args";

/// Id given to placeholder records created for a failed fetch.
pub const UNKNOWN_BUILD_ID: &str = "0";

/// A file backing a build (image, test zip, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    pub path: PathBuf,
    pub version: String,
}

/// Per-device build metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    pub branch: Option<String>,
    pub flavor: Option<String>,
    pub device_serial: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub files: BTreeMap<String, BuildFile>,
    /// Set on records synthesized to stand in for a failed fetch.
    pub placeholder: bool,
}

impl BuildRecord {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            branch: None,
            flavor: None,
            device_serial: None,
            attributes: BTreeMap::new(),
            files: BTreeMap::new(),
            placeholder: false,
        }
    }

    pub fn placeholder() -> Self {
        let mut record = Self::new(UNKNOWN_BUILD_ID);
        record.placeholder = true;
        record
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    pub fn with_file(mut self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.set_file(key, path, self.build_id.clone());
        self
    }

    pub fn set_file(&mut self, key: impl Into<String>, path: impl Into<PathBuf>, version: String) {
        self.files.insert(
            key.into(),
            BuildFile {
                path: path.into(),
                version,
            },
        );
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn file(&self, key: &str) -> Option<&Path> {
        self.files.get(key).map(|f| f.path.as_path())
    }

    /// Clone the record, copying every backing file that exists on disk into
    /// `dir` so that cleaning up either copy leaves the other intact.
    pub fn deep_clone(&self, dir: &Path) -> Result<BuildRecord> {
        std::fs::create_dir_all(dir)?;
        let mut clone = self.clone();
        for (key, file) in clone.files.iter_mut() {
            if !file.path.is_file() {
                continue;
            }
            let name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| key.clone());
            let target = dir.join(format!("{key}-{name}"));
            std::fs::copy(&file.path, &target)?;
            tracing::debug!(
                build_id = %self.build_id,
                file = %key,
                target = %target.display(),
                "copied build file for clone"
            );
            file.path = target;
        }
        Ok(clone)
    }
}
