//! Value types carried by result sink callbacks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Tests and modules
// ---------------------------------------------------------------------------

/// Identity of a single test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestDescription {
    pub class_name: String,
    pub test_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Context of a module, reported at `test_module_started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleContext {
    pub module_id: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
}

impl ModuleContext {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            attributes: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Whether a metric came straight from the run or was derived afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Raw,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Measurement {
    Text(String),
    Double(f64),
    Int(i64),
    Numbers(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub measurement: Measurement,
    pub data_type: DataType,
}

impl Metric {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            measurement: Measurement::Text(value.into()),
            data_type: DataType::Raw,
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            measurement: Measurement::Double(value),
            data_type: DataType::Raw,
        }
    }

    pub fn processed(mut self) -> Self {
        self.data_type = DataType::Processed;
        self
    }

    /// Text rendering of the measurement.
    pub fn as_text(&self) -> String {
        match &self.measurement {
            Measurement::Text(s) => s.clone(),
            Measurement::Double(v) => v.to_string(),
            Measurement::Int(v) => v.to_string(),
            Measurement::Numbers(vs) => vs
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Insertion-ordered metric map.
///
/// Key order is observable: decorators that run closer to the raw run insert
/// first, and reporters iterate in insertion order. Re-inserting an existing
/// key replaces the value in place.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    entries: Vec<(String, Metric)>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, metric: Metric) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = metric,
            None => self.entries.push((key, metric)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, m)| m)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Metric)> {
        self.entries.iter().map(|(k, m)| (k.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every entry of `other`, replacing values of keys already present.
    pub fn extend(&mut self, other: RunMetrics) {
        for (key, metric) in other.entries {
            self.insert(key, metric);
        }
    }
}

impl FromIterator<(String, Metric)> for RunMetrics {
    fn from_iter<I: IntoIterator<Item = (String, Metric)>>(iter: I) -> Self {
        let mut metrics = RunMetrics::new();
        for (key, metric) in iter {
            metrics.insert(key, metric);
        }
        metrics
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDataType {
    Text,
    HostLog,
    Logcat,
    Bugreport,
    Screenshot,
    Kernel,
    Unknown,
}

impl LogDataType {
    pub fn extension(&self) -> &'static str {
        match self {
            LogDataType::Text | LogDataType::HostLog | LogDataType::Logcat | LogDataType::Kernel => {
                "txt"
            }
            LogDataType::Bugreport => "zip",
            LogDataType::Screenshot => "png",
            LogDataType::Unknown => "dat",
        }
    }
}

/// Captured log bytes, cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct LogData(Arc<[u8]>);

impl LogData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex-encoded SHA-256 of the contents.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl fmt::Debug for LogData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogData({} bytes)", self.0.len())
    }
}

impl From<&str> for LogData {
    fn from(s: &str) -> Self {
        LogData::new(s.as_bytes().to_vec())
    }
}

/// Handle to a saved log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub path: PathBuf,
    pub url: Option<String>,
    pub data_type: LogDataType,
    pub digest: String,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Short summary a listener hands back at the end of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub reporter: String,
    pub label: String,
    pub source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_metrics_preserves_insertion_order() {
        let mut metrics = RunMetrics::new();
        metrics.insert("b", Metric::text("1"));
        metrics.insert("a", Metric::text("2"));
        metrics.insert("b", Metric::text("3"));

        assert_eq!(metrics.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(metrics.get("b").unwrap().as_text(), "3");
    }

    #[test]
    fn test_log_data_digest_is_stable() {
        let data = LogData::from("hello");
        assert_eq!(
            data.digest(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(format!("{:?}", data), "LogData(5 bytes)");
    }
}
