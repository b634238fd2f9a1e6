//! Centralised tracing initialisation.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Pass a
//! [`HostLogBuffer`] to [`init_tracing_with_host_log`] to also capture the
//! formatted output; the executor reports that capture as the `host_log`.
//!
//! Subsequent calls are silently ignored (the global subscriber can only be
//! set once per process).

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use invoker_domain::LogData;

/// Initialise the global tracing subscriber.
///
/// * `json`: when `true`, emit newline-delimited JSON log lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Like [`init_tracing`], additionally teeing plain-text output into `buffer`.
pub fn init_tracing_with_host_log(json: bool, level: Level, buffer: HostLogBuffer) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(buffer),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(buffer),
            )
            .try_init()
            .ok();
    }
}

/// In-memory capture of host log output.
///
/// Cloning shares the buffer. [`HostLogBuffer::take`] drains it, so the
/// pre-sharding chunk and the final chunk of an invocation do not overlap.
#[derive(Debug, Clone, Default)]
pub struct HostLogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Drain everything captured so far; `None` when nothing was captured.
    pub fn take(&self) -> Option<LogData> {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        if bytes.is_empty() {
            return None;
        }
        Some(LogData::new(std::mem::take(&mut *bytes)))
    }
}

/// Writer handed out per event by [`HostLogBuffer`]'s `MakeWriter` impl.
pub struct HostLogWriter {
    buffer: HostLogBuffer,
}

impl io::Write for HostLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for HostLogBuffer {
    type Writer = HostLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        HostLogWriter {
            buffer: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_take_drains_buffer() {
        let buffer = HostLogBuffer::new();
        assert!(buffer.take().is_none());

        buffer.make_writer().write_all(b"line one\n").expect("write");
        buffer.make_writer().write_all(b"line two\n").expect("write");
        let first = buffer.take().expect("captured");
        assert_eq!(first.as_bytes(), b"line one\nline two\n");
        assert!(buffer.take().is_none());
    }

    #[test]
    fn test_captures_events_with_scoped_subscriber() {
        let buffer = HostLogBuffer::new();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(buffer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(event = "invocation.started", "hello host log");
        });

        let captured = buffer.take().expect("captured");
        let text = String::from_utf8_lossy(captured.as_bytes()).to_string();
        assert!(text.contains("hello host log"));
    }
}
