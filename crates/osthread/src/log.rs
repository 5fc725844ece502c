//! Structured JSONL event log.
//!
//! Lifecycle events (thread start/join/detach, key allocation) and every
//! contract-violation fault are written as one JSON object per line. The sink
//! is chosen by [`crate::config::log_destination`] on first emit, or replaced
//! with [`set_sink`].
//!
//! Hot paths (`ThreadLocalKey::get`/`set`, uncontended locking) never log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{self, LogDestination};
use crate::platform;

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Parse a level name (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    pub(crate) const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            _ => Self::Fatal,
        }
    }
}

/// One structured event.
///
/// Required fields: `timestamp`, `seq`, `level`, `event`, `backend`, `thread_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub seq: u64,
    pub level: LogLevel,
    pub event: String,
    pub backend: String,
    /// `ThreadId` of the emitting thread.
    pub thread_id: usize,

    /// Thread name the event is about (start/join/panic events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

impl LogEntry {
    /// Create an entry with the required fields filled in for the calling thread.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            level,
            event: event.into(),
            backend: platform::backend_name().to_string(),
            thread_id: crate::thread::current_id().as_usize(),
            thread: None,
            join_id: None,
            errno: None,
            fault: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, name: impl Into<String>) -> Self {
        self.thread = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_join_id(mut self, join_id: u64) -> Self {
        self.join_id = Some(join_id);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_fault(mut self, fault: impl Into<String>) -> Self {
        self.fault = Some(fault.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Replacement sink for [`set_sink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Off,
    Stderr,
    /// Append to the file at this path.
    File(std::path::PathBuf),
    /// Keep lines in memory; drain with [`take_captured`].
    Capture,
}

enum SinkState {
    Off,
    Stderr,
    File(BufWriter<File>),
    Capture(Vec<String>),
}

impl SinkState {
    fn open(sink: LogSink) -> Self {
        match sink {
            LogSink::Off => Self::Off,
            LogSink::Stderr => Self::Stderr,
            LogSink::Capture => Self::Capture(Vec::new()),
            LogSink::File(path) => match OpenOptions::new().create(true).append(true).open(&path)
            {
                Ok(file) => Self::File(BufWriter::new(file)),
                Err(err) => {
                    eprintln!(
                        "osthread: cannot open log file {}: {err}; logging to stderr",
                        path.display()
                    );
                    Self::Stderr
                }
            },
        }
    }

    fn from_config() -> Self {
        Self::open(match config::log_destination() {
            LogDestination::Off => LogSink::Off,
            LogDestination::Stderr => LogSink::Stderr,
            LogDestination::File(path) => LogSink::File(path),
        })
    }

    fn write_line(&mut self, line: String) {
        match self {
            Self::Off => {}
            Self::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{line}");
            }
            Self::File(writer) => {
                // Flushed per line: a fatal entry is usually followed by abort.
                let _ = writeln!(writer, "{line}");
                let _ = writer.flush();
            }
            Self::Capture(lines) => lines.push(line),
        }
    }
}

/// `None` until the first emit resolves the configured destination.
static SINK: Mutex<Option<SinkState>> = parking_lot::const_mutex(None);

/// Returns true if entries at `level` are currently written.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level >= config::log_level()
}

/// Write `entry` to the sink if its level is enabled.
pub fn emit(entry: &LogEntry) {
    if !enabled(entry.level) {
        return;
    }
    let Ok(line) = entry.to_jsonl() else {
        return;
    };
    let mut sink = SINK.lock();
    sink.get_or_insert_with(SinkState::from_config)
        .write_line(line);
}

/// Build and emit an entry only when `level` is enabled.
pub(crate) fn event(level: LogLevel, event: &str, build: impl FnOnce(LogEntry) -> LogEntry) {
    if enabled(level) {
        emit(&build(LogEntry::new(level, event)));
    }
}

/// Replace the sink. Flushes and closes a previous file sink.
pub fn set_sink(sink: LogSink) {
    let mut state = SINK.lock();
    if let Some(SinkState::File(writer)) = state.as_mut() {
        let _ = writer.flush();
    }
    *state = Some(SinkState::open(sink));
}

/// Drain lines written to a [`LogSink::Capture`] sink.
#[must_use]
pub fn take_captured() -> Vec<String> {
    match SINK.lock().as_mut() {
        Some(SinkState::Capture(lines)) => std::mem::take(lines),
        _ => Vec::new(),
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to (year, month, day) in the proleptic Gregorian calendar.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_required_fields_only() {
        let entry = LogEntry::new(LogLevel::Info, "thread_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "thread_start");
        assert_eq!(parsed["backend"], platform::backend_name());
        assert_eq!(
            parsed["thread_id"],
            crate::thread::current_id().as_usize() as u64
        );
        assert!(parsed.get("thread").is_none());
        assert!(parsed.get("errno").is_none());
        assert!(parsed.get("fault").is_none());
    }

    #[test]
    fn optional_fields_serialize_when_set() {
        let entry = LogEntry::new(LogLevel::Warn, "thread_start_failed")
            .with_thread("worker-1")
            .with_join_id(9)
            .with_errno(11)
            .with_details(serde_json::json!({"stack_size": 65536}));
        let parsed: serde_json::Value = serde_json::from_str(&entry.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["thread"], "worker-1");
        assert_eq!(parsed["join_id"], 9);
        assert_eq!(parsed["errno"], 11);
        assert_eq!(parsed["details"]["stack_size"], 65536);
    }

    #[test]
    fn sequence_numbers_increase() {
        let a = LogEntry::new(LogLevel::Debug, "a");
        let b = LogEntry::new(LogLevel::Debug, "b");
        assert!(b.seq > a.seq);
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::from_str_loose("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str_loose("loud"), None);
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(59), (1970, 3, 1));
        // 2000-02-29, a leap day in a century leap year.
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn timestamp_shape() {
        let ts = now_utc();
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }
}
