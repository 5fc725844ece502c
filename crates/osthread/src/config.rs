//! Runtime configuration.
//!
//! Settings are read from the environment on first use and cached in atomics:
//! - `OSTHREAD_FAULT_POLICY`: `abort` (default) or `panic`. Selects what
//!   [`crate::fault::raise`] does after logging a contract violation.
//! - `OSTHREAD_LOG`: `off`, `stderr` (default) or a file path for the JSONL
//!   event log.
//! - `OSTHREAD_LOG_LEVEL`: minimum level written to the log (default `warn`).
//! - `OSTHREAD_STACK_SIZE`: default thread stack size in bytes, with optional
//!   `k`/`m`/`g` suffix (default 2 MiB).
//!
//! Every cached setting also has a programmatic override, which wins over the
//! environment from the moment it is stored.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::log::LogLevel;

/// Default thread stack size: 2 MiB (matches glibc default).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// What to do once a contract violation has been logged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPolicy {
    /// Terminate the process immediately.
    #[default]
    Abort,
    /// Panic on the faulting thread. Intended for test harnesses.
    Panic,
}

impl FaultPolicy {
    /// Parse from string (case-insensitive). Unknown values select `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "unwind" | "test" => Self::Panic,
            _ => Self::Abort,
        }
    }
}

/// Where the structured event log goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Off,
    Stderr,
    File(PathBuf),
}

impl LogDestination {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "stderr" | "2" => Self::Stderr,
            "off" | "none" | "0" => Self::Off,
            _ => Self::File(PathBuf::from(trimmed)),
        }
    }
}

// Atomic cache: 0=unresolved, 255=resolving, anything else is an encoded value.
// Concurrent callers that observe RESOLVING get the default instead of blocking.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

static CACHED_FAULT_POLICY: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_LOG_LEVEL: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

const POLICY_ABORT: u8 = 1;
const POLICY_PANIC: u8 = 2;

fn policy_to_u8(policy: FaultPolicy) -> u8 {
    match policy {
        FaultPolicy::Abort => POLICY_ABORT,
        FaultPolicy::Panic => POLICY_PANIC,
    }
}

fn u8_to_policy(v: u8) -> FaultPolicy {
    match v {
        POLICY_PANIC => FaultPolicy::Panic,
        _ => FaultPolicy::Abort,
    }
}

fn level_to_u8(level: LogLevel) -> u8 {
    level as u8 + 1
}

fn u8_to_level(v: u8) -> LogLevel {
    LogLevel::from_index(v.saturating_sub(1))
}

/// Resolve a u8-encoded setting once, tolerating concurrent and reentrant callers.
fn resolve_cached(cache: &AtomicU8, default: u8, resolve: impl FnOnce() -> u8) -> u8 {
    let cached = cache.load(Ordering::Acquire);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return default;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        let v = cache.load(Ordering::Acquire);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            default
        };
    }
    let resolved = resolve();
    // An override stored while we were resolving takes precedence.
    match cache.compare_exchange(RESOLVING, resolved, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => resolved,
        Err(current) => current,
    }
}

/// Configured fault policy (reads `OSTHREAD_FAULT_POLICY` on first call).
#[must_use]
pub fn fault_policy() -> FaultPolicy {
    let v = resolve_cached(&CACHED_FAULT_POLICY, POLICY_ABORT, || {
        let policy = std::env::var("OSTHREAD_FAULT_POLICY")
            .map(|v| FaultPolicy::from_str_loose(&v))
            .unwrap_or_default();
        policy_to_u8(policy)
    });
    u8_to_policy(v)
}

/// Override the fault policy for the rest of the process.
pub fn set_fault_policy(policy: FaultPolicy) {
    CACHED_FAULT_POLICY.store(policy_to_u8(policy), Ordering::Release);
}

/// Minimum level written to the event log (reads `OSTHREAD_LOG_LEVEL` on first call).
#[must_use]
pub fn log_level() -> LogLevel {
    let default = level_to_u8(LogLevel::Warn);
    let v = resolve_cached(&CACHED_LOG_LEVEL, default, || {
        let level = std::env::var("OSTHREAD_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::from_str_loose(&v))
            .unwrap_or(LogLevel::Warn);
        level_to_u8(level)
    });
    u8_to_level(v)
}

/// Override the minimum log level for the rest of the process.
pub fn set_log_level(level: LogLevel) {
    CACHED_LOG_LEVEL.store(level_to_u8(level), Ordering::Release);
}

/// Destination named by `OSTHREAD_LOG`. Read on every call; the log module
/// resolves it once when it opens its sink.
#[must_use]
pub fn log_destination() -> LogDestination {
    std::env::var("OSTHREAD_LOG")
        .map(|v| LogDestination::from_str_loose(&v))
        .unwrap_or(LogDestination::Stderr)
}

/// Default stack size for threads started with a zero hint.
#[must_use]
pub fn default_stack_size() -> usize {
    let cached = CACHED_STACK_SIZE.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let size = std::env::var("OSTHREAD_STACK_SIZE")
        .ok()
        .and_then(|v| parse_size(&v))
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_STACK_SIZE);
    // Racing resolvers compute the same value; first store wins.
    match CACHED_STACK_SIZE.compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => size,
        Err(current) => current,
    }
}

/// Override the default stack size. Zero restores the built-in default.
pub fn set_default_stack_size(bytes: usize) {
    let bytes = if bytes == 0 { DEFAULT_STACK_SIZE } else { bytes };
    CACHED_STACK_SIZE.store(bytes, Ordering::Release);
}

/// Parse a byte count such as `65536`, `512k`, `8M` or `1g`.
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, shift) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}
