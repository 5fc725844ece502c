//! Native thread lifecycle: start, join, detach, identity.
//!
//! Every started thread gets a [`ThreadJoinId`] registered in a process-wide
//! join table until it is joined or detached. The table is what turns a
//! double join, a join after detach, or a forged raw id into a deterministic
//! fault instead of undefined behavior in the native join call.
//!
//! Lifecycle per entry: `Starting` until the new thread runs its first
//! instruction of wrapper code, `Running` while the entry routine executes,
//! `Finished` once it has returned. Joining or detaching removes the entry.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config;
use crate::error::Result;
use crate::fault::{self, Fault};
use crate::log::{self, LogEntry, LogLevel};
use crate::platform::{Backend, Native, NativeJoinToken, ThreadMain};

/// Entry routine for [`start`]; receives the `arg` word passed to `start`.
pub type ThreadEntry = fn(usize);

/// Smallest stack a started thread gets, whatever the hint.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Largest stack a hint can request.
pub const MAX_STACK_SIZE: usize = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Lightweight identifier of a live thread. Never zero for a real thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(usize);

impl ThreadId {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) const fn from_usize(raw: usize) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for one joinable thread. Consumed by exactly one [`join`] or
/// [`detach`]; dropping it instead leaves the native thread unjoined until the
/// process exits.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a started thread must be joined or detached"]
pub struct ThreadJoinId(u64);

impl ThreadJoinId {
    /// Raw form for storage in foreign structures.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }

    /// Rebuild an id from [`into_raw`](Self::into_raw). A raw value that no
    /// longer names a joinable thread faults when used.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle of a thread still in the join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadState {
    Starting = 0,
    Running = 1,
    Finished = 2,
}

impl ThreadState {
    const fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            _ => Self::Finished,
        }
    }
}

/// Name and stack size for [`spawn`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    name: Option<String>,
    stack_size: usize,
}

impl ThreadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Best-effort thread name. Truncated to what the platform accepts.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Advisory stack size; 0 selects the configured default.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

// ---------------------------------------------------------------------------
// Join table
// ---------------------------------------------------------------------------

/// Shared between the join table and the running thread.
struct ThreadControl {
    state: AtomicU32,
    /// `ThreadId` of the running thread; 0 until it starts.
    thread_id: AtomicUsize,
}

struct JoinEntry {
    token: NativeJoinToken,
    control: Arc<ThreadControl>,
    name: Option<String>,
}

static NEXT_JOIN_ID: AtomicU64 = AtomicU64::new(1);

fn join_table() -> &'static Mutex<HashMap<u64, JoinEntry>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, JoinEntry>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Remove `id` from the join table for a join or detach by the calling thread.
#[track_caller]
fn take_entry(id: u64, joining: bool) -> JoinEntry {
    let me = current_id().as_usize();
    let mut table = join_table().lock();
    match table.remove(&id) {
        Some(entry) if joining && entry.control.thread_id.load(Ordering::Acquire) == me => {
            table.insert(id, entry);
            drop(table);
            fault::raise(Fault::JoinSelf)
        }
        Some(entry) => entry,
        None => {
            drop(table);
            fault::raise(Fault::UnknownJoinId)
        }
    }
}

fn with_name(entry: LogEntry, name: Option<&str>) -> LogEntry {
    match name {
        Some(name) => entry.with_thread(name),
        None => entry,
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Identifier of the calling thread. Cached per thread after the first call.
#[must_use]
pub fn current_id() -> ThreadId {
    ThreadId(Native::current_thread_id())
}

/// Effective stack size for a hint: 0 selects the configured default, and
/// the result always lies in `[max(MIN_STACK_SIZE, native minimum), MAX_STACK_SIZE]`.
#[must_use]
pub fn clamp_stack_size(hint: usize) -> usize {
    let requested = if hint == 0 {
        config::default_stack_size()
    } else {
        hint
    };
    let floor = MIN_STACK_SIZE.max(Native::min_stack_size());
    requested.clamp(floor, MAX_STACK_SIZE.max(floor))
}

/// Start a native thread running `entry(arg)`.
///
/// # Errors
///
/// `ResourceExhausted` (resource `Thread`) when the OS refuses a new thread.
pub fn start(
    entry: ThreadEntry,
    arg: usize,
    name: Option<&str>,
    stack_size_hint: usize,
) -> Result<ThreadJoinId> {
    let mut options = ThreadOptions::new().stack_size(stack_size_hint);
    if let Some(name) = name {
        options = options.name(name);
    }
    spawn(options, move || entry(arg))
}

/// Start a native thread running `f`.
///
/// A panic escaping `f` is unrecoverable: it is logged at `fatal` and the
/// process aborts.
///
/// # Errors
///
/// As for [`start`].
pub fn spawn<F>(options: ThreadOptions, f: F) -> Result<ThreadJoinId>
where
    F: FnOnce() + Send + 'static,
{
    let stack_size = clamp_stack_size(options.stack_size);
    // Native name APIs take C strings.
    let name = options.name.map(|mut name| {
        if let Some(nul) = name.find('\0') {
            name.truncate(nul);
        }
        name
    });
    let join_id = NEXT_JOIN_ID.fetch_add(1, Ordering::Relaxed);

    let control = Arc::new(ThreadControl {
        state: AtomicU32::new(ThreadState::Starting as u32),
        thread_id: AtomicUsize::new(0),
    });
    let main: ThreadMain = {
        let control = Arc::clone(&control);
        let name = name.clone();
        Box::new(move || run_entry(&control, name.as_deref(), join_id, f))
    };

    match Native::spawn(name.clone(), stack_size, main) {
        Ok(token) => {
            log::event(LogLevel::Debug, "thread_start", |e| {
                with_name(e, name.as_deref())
                    .with_join_id(join_id)
                    .with_details(serde_json::json!({ "stack_size": stack_size }))
            });
            join_table().lock().insert(
                join_id,
                JoinEntry {
                    token,
                    control,
                    name,
                },
            );
            Ok(ThreadJoinId(join_id))
        }
        Err(err) => {
            log::event(LogLevel::Warn, "thread_start_failed", |e| {
                with_name(e, name.as_deref())
                    .with_errno(err.code())
                    .with_details(serde_json::json!({
                        "stack_size": stack_size,
                        "error": err.to_string(),
                    }))
            });
            Err(err)
        }
    }
}

fn run_entry(control: &ThreadControl, name: Option<&str>, join_id: u64, f: impl FnOnce()) {
    control
        .thread_id
        .store(current_id().as_usize(), Ordering::Release);
    control
        .state
        .store(ThreadState::Running as u32, Ordering::Release);

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::emit(
            &with_name(LogEntry::new(LogLevel::Fatal, "entry_panicked"), name)
                .with_join_id(join_id)
                .with_details(serde_json::json!({ "message": message })),
        );
        eprintln!("osthread: entry routine panicked ({message}); aborting");
        std::process::abort();
    }

    control
        .state
        .store(ThreadState::Finished as u32, Ordering::Release);
}

/// Wait for the thread to finish and reclaim it.
///
/// Faults with `UnknownJoinId` if `id` was already joined or detached (or
/// never issued), and with `JoinSelf` if it names the calling thread.
#[track_caller]
pub fn join(id: ThreadJoinId) {
    let entry = take_entry(id.0, true);
    Native::join(entry.token);
    log::event(LogLevel::Debug, "thread_join", |e| {
        with_name(e, entry.name.as_deref()).with_join_id(id.0)
    });
}

/// Let the thread run to completion unjoined; its resources are reclaimed
/// when it exits.
#[track_caller]
pub fn detach(id: ThreadJoinId) {
    let entry = take_entry(id.0, false);
    Native::detach(entry.token);
    log::event(LogLevel::Debug, "thread_detach", |e| {
        with_name(e, entry.name.as_deref()).with_join_id(id.0)
    });
}

/// `ThreadId` of a started thread, or `None` until it begins running.
#[track_caller]
#[must_use]
pub fn thread_id_of(id: &ThreadJoinId) -> Option<ThreadId> {
    let table = join_table().lock();
    match table.get(&id.0) {
        Some(entry) => ThreadId::from_usize(entry.control.thread_id.load(Ordering::Acquire)),
        None => {
            drop(table);
            fault::raise(Fault::UnknownJoinId)
        }
    }
}

#[track_caller]
#[must_use]
pub fn state_of(id: &ThreadJoinId) -> ThreadState {
    let table = join_table().lock();
    match table.get(&id.0) {
        Some(entry) => ThreadState::from_u32(entry.control.state.load(Ordering::Acquire)),
        None => {
            drop(table);
            fault::raise(Fault::UnknownJoinId)
        }
    }
}
