//! Log savers: [`FileLogSaver`] on disk, [`InMemoryLogSaver`] when no
//! saver is configured.
//!
//! File layout: `<root>/<invocation id>/<seq>-<name>-<digest prefix>.<ext>`.
//! The sequence number keeps handles distinct when the same log name is
//! saved again (one file per retry attempt). Files are written to a temp
//! file in the target directory and renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tempfile::NamedTempFile;

use invoker_domain::{InvocationContext, LogData, LogDataType, LogFile, LogSaver, Result};

const DIGEST_PREFIX_LEN: usize = 12;

pub struct FileLogSaver {
    root: PathBuf,
    dir: PathBuf,
    url_base: Option<String>,
    next: usize,
}

impl FileLogSaver {
    /// Create a saver writing under `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            dir: root.join("unassigned"),
            root,
            url_base: None,
            next: 0,
        })
    }

    /// Publish saved logs under `base` as well; the handle's url is
    /// `<base>/<invocation id>/<file name>`.
    pub fn with_url_base(mut self, base: impl Into<String>) -> Self {
        self.url_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    /// Directory of the current invocation.
    pub fn invocation_dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&mut self, name: &str, data_type: LogDataType, digest: &str) -> String {
        let seq = self.next;
        self.next += 1;
        format!(
            "{seq:04}-{}-{}.{}",
            sanitize(name),
            &digest[..DIGEST_PREFIX_LEN.min(digest.len())],
            data_type.extension()
        )
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl LogSaver for FileLogSaver {
    fn invocation_started(&mut self, context: &InvocationContext) -> Result<()> {
        self.dir = self.root.join(context.invocation_id().to_string());
        fs::create_dir_all(&self.dir)?;
        tracing::debug!(dir = %self.dir.display(), "log directory ready");
        Ok(())
    }

    fn save_log_data(&mut self, name: &str, data_type: LogDataType, data: &LogData) -> Result<LogFile> {
        fs::create_dir_all(&self.dir)?;
        let digest = data.digest();
        let file_name = self.file_name(name, data_type, &digest);
        let path = self.dir.join(&file_name);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;

        let url = self.url_base.as_ref().map(|base| {
            let invocation = self
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{base}/{invocation}/{file_name}")
        });
        Ok(LogFile {
            path,
            url,
            data_type,
            digest,
            size: data.len() as u64,
        })
    }

    fn invocation_ended(&mut self, elapsed: Duration) {
        tracing::debug!(
            dir = %self.dir.display(),
            saved = self.next,
            elapsed_ms = elapsed.as_millis() as u64,
            "log saver finished"
        );
    }
}

/// Keeps every saved log in memory. Cloning shares the store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogSaver {
    logs: Arc<Mutex<Vec<(LogFile, LogData)>>>,
}

impl InMemoryLogSaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved handles with their contents, in save order.
    pub fn logs(&self) -> Vec<(LogFile, LogData)> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSaver for InMemoryLogSaver {
    fn save_log_data(&mut self, name: &str, data_type: LogDataType, data: &LogData) -> Result<LogFile> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let file = LogFile {
            path: PathBuf::from(format!(
                "memory/{:04}-{}.{}",
                logs.len(),
                sanitize(name),
                data_type.extension()
            )),
            url: None,
            data_type,
            digest: data.digest(),
            size: data.len() as u64,
        };
        logs.push((file.clone(), data.clone()));
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_saver() -> (tempfile::TempDir, FileLogSaver) {
        let dir = tempfile::tempdir().expect("tempdir");
        let saver = FileLogSaver::new(dir.path()).expect("saver");
        (dir, saver)
    }

    #[test]
    fn test_saves_under_invocation_dir() {
        let (dir, mut saver) = make_saver();
        let ctx = InvocationContext::new("stub");
        saver.invocation_started(&ctx).expect("start");

        let data = LogData::from("hello");
        let file = saver
            .save_log_data("host_log", LogDataType::HostLog, &data)
            .expect("save");

        assert!(file
            .path
            .starts_with(dir.path().join(ctx.invocation_id().to_string())));
        assert_eq!(fs::read(&file.path).expect("read"), b"hello");
        assert_eq!(file.digest, data.digest());
        assert_eq!(file.size, 5);
        assert!(file.path.to_string_lossy().ends_with(".txt"));
    }

    #[test]
    fn test_repeated_name_gets_distinct_files() {
        let (_dir, mut saver) = make_saver();
        let data = LogData::from("same bytes");
        let first = saver
            .save_log_data("logcat", LogDataType::Logcat, &data)
            .expect("save");
        let second = saver
            .save_log_data("logcat", LogDataType::Logcat, &data)
            .expect("save");

        assert_ne!(first.path, second.path);
        assert_eq!(first.digest, second.digest);
        assert!(first.path.exists() && second.path.exists());
    }

    #[test]
    fn test_unsafe_names_and_url() {
        let (_dir, saver) = make_saver();
        let mut saver = saver.with_url_base("https://logs.example/");
        let file = saver
            .save_log_data("Suite#case/1", LogDataType::Screenshot, &LogData::from("png"))
            .expect("save");

        let name = file.path.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.starts_with("0000-Suite_case_1-"));
        assert!(name.ends_with(".png"));
        let url = file.url.expect("url");
        assert!(url.starts_with("https://logs.example/unassigned/"));
        assert!(url.ends_with(&name));
    }

    #[test]
    fn test_in_memory_saver_keeps_contents() {
        let saver = InMemoryLogSaver::new();
        let mut writer = saver.clone();
        let file = writer
            .save_log_data("host log", LogDataType::HostLog, &LogData::from("captured"))
            .expect("save");

        assert!(file.path.to_string_lossy().starts_with("memory/0000-host_log"));
        let logs = saver.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].1.as_bytes(), b"captured");
    }
}
