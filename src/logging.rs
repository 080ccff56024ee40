//! Logging and tracing initialization for bids2datalad.
//!
//! Two destinations are fed from the same `tracing` events:
//! - the interactive console (pretty or JSON, filtered by `RUST_LOG`)
//! - the durable run log, a [`LogSink`] that starts in memory and is moved
//!   next to the dataset once it exists.
//!
//! Short status lines for the operator are printed with [`print_status`] and
//! mirrored into the run log under the [`STATUS_TARGET`] target.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crossterm::style::Stylize;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::Directive,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::{SubscriberInitExt, TryInitError},
};

/// Target used for operator status lines; hidden from the console layer
/// because [`print_status`] already rendered them there.
pub const STATUS_TARGET: &str = "bids2datalad::status";

/// Configuration for the logging system.
#[derive(Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// The console level can be overridden at runtime via `RUST_LOG`. When a
/// sink is given, every crate event down to DEBUG is also appended to it.
pub fn init(config: LogConfig, sink: Option<LogSink>) -> Result<(), TryInitError> {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let console_filter = || {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "bids2datalad={}",
                default_level.as_str().to_lowercase()
            ))
        });
        match format!("{STATUS_TARGET}=off").parse::<Directive>() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    };

    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_filter(console_filter())
    });

    let pretty_layer = (!config.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(io::stderr)
            .with_filter(console_filter())
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(pretty_layer)
        .with(sink.map(file_layer))
        .try_init()
}

/// Layer appending plain-text events to the durable run log.
pub fn file_layer<S>(sink: LogSink) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(sink)
        .with_filter(EnvFilter::new("bids2datalad=debug"))
}

/// Severity and icon of an operator status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Step,
    Info,
    Ok,
    Warn,
    Fail,
}

/// Print an iconified, colored status line and mirror it into the run log.
pub fn print_status(kind: Status, message: &str) {
    match kind {
        Status::Step => println!("{} {}", "▶".cyan().bold(), message.bold()),
        Status::Info => println!("{} {}", "ℹ".blue(), message),
        Status::Ok => println!("{} {}", "✔".green(), message),
        Status::Warn => eprintln!("{} {}", "⚠".yellow(), message.yellow()),
        Status::Fail => eprintln!("{} {}", "✖".red().bold(), message.red()),
    }

    match kind {
        Status::Step | Status::Info | Status::Ok => {
            tracing::info!(target: STATUS_TARGET, "{}", message)
        }
        Status::Warn => tracing::warn!(target: STATUS_TARGET, "{}", message),
        Status::Fail => tracing::error!(target: STATUS_TARGET, "{}", message),
    }
}

enum SinkTarget {
    Buffer(Vec<u8>),
    File { path: PathBuf, file: File },
}

/// Durable run log.
///
/// Writes are buffered in memory until [`LogSink::persist_to`] attaches a
/// file; later calls move the accumulated log to the new location.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<SinkTarget>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::buffered()
    }
}

impl LogSink {
    pub fn buffered() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkTarget::Buffer(Vec::new()))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkTarget> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current file location, `None` while still buffering in memory.
    pub fn location(&self) -> Option<PathBuf> {
        match &*self.lock() {
            SinkTarget::Buffer(_) => None,
            SinkTarget::File { path, .. } => Some(path.clone()),
        }
    }

    /// Move the log (buffer or previous file) to `path` and keep appending there.
    pub fn persist_to(&self, path: &Path) -> io::Result<()> {
        let mut target = self.lock();

        let carried = match &mut *target {
            SinkTarget::Buffer(buf) => std::mem::take(buf),
            SinkTarget::File { path: old, file } => {
                if old == path {
                    return Ok(());
                }
                file.flush()?;
                fs::read(&*old)?
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&carried)?;

        if let SinkTarget::File { path: old, .. } = &*target {
            let _ = fs::remove_file(old);
        }

        *target = SinkTarget::File {
            path: path.to_path_buf(),
            file,
        };
        Ok(())
    }

    /// Everything written so far.
    pub fn contents(&self) -> io::Result<String> {
        match &mut *self.lock() {
            SinkTarget::Buffer(buf) => Ok(String::from_utf8_lossy(buf).into_owned()),
            SinkTarget::File { path, file } => {
                file.flush()?;
                fs::read_to_string(&*path)
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.lock() {
            SinkTarget::Buffer(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            SinkTarget::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.lock() {
            SinkTarget::Buffer(_) => Ok(()),
            SinkTarget::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A rate limiter for throttling log messages.
///
/// Useful for progress updates that would otherwise spam the logs.
pub struct LogThrottle {
    interval_ms: u64,
    /// Stores the last log time in ms, or u64::MAX to indicate "never logged"
    last_log_ms: AtomicU64,
    start: Instant,
}

/// Sentinel value indicating the throttle has never logged
const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    /// Create a new throttle with the given minimum interval between logs.
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // Losing the race means another thread just logged
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Reset the throttle, allowing the next log immediately.
    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn sink_buffers_until_persisted() {
        let temp = tempdir().unwrap();
        let mut sink = LogSink::buffered();
        sink.write_all(b"first line\n").unwrap();
        assert!(sink.location().is_none());

        let path = temp.path().join("run.log");
        sink.persist_to(&path).unwrap();
        sink.write_all(b"second line\n").unwrap();
        sink.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first line\nsecond line\n");
        assert_eq!(sink.location(), Some(path));
    }

    #[test]
    fn sink_moves_between_files() {
        let temp = tempdir().unwrap();
        let first = temp.path().join("a/run.log");
        let second = temp.path().join("b/run.log");

        let mut sink = LogSink::buffered();
        sink.persist_to(&first).unwrap();
        sink.write_all(b"kept\n").unwrap();
        sink.persist_to(&second).unwrap();

        assert!(!first.exists());
        assert_eq!(sink.contents().unwrap(), "kept\n");
    }

    #[test]
    fn file_layer_captures_events() {
        let sink = LogSink::buffered();
        let subscriber = tracing_subscriber::registry().with(file_layer(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "bids2datalad::test", "hello from the run");
        });
        assert!(sink.contents().unwrap().contains("hello from the run"));
    }
}
