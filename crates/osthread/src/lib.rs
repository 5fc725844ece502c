//! osthread: a portable OS thread abstraction layer.
//!
//! One uniform set of native threading primitives for a managed runtime:
//!
//! - [`ThreadLocalKey`]: per-thread machine-word slots.
//! - [`Mutex`]: non-reentrant exclusive lock with scoped guards.
//! - [`Monitor`]: a mutex with wait / notify-one / notify-all.
//! - [`thread`]: start, join and detach native threads; cheap thread ids.
//!
//! Exactly one native backend is compiled in (see [`backend_name`]); every
//! primitive has the same ordering and failure semantics on each.
//!
//! Resource acquisition failures come back as [`ThreadError`]. Misuse (an
//! unset key, a recursive acquire, a double join, a wait without the lock)
//! is a [`Fault`]: it is logged and then stops the process, or panics when
//! [`config::FaultPolicy::Panic`] is selected.

pub mod config;
pub mod error;
pub mod fault;
pub mod log;
pub mod monitor;
pub mod mutex;
mod platform;
pub mod thread;
pub mod tls;

pub use error::{Resource, Result, ThreadError};
pub use fault::Fault;
pub use monitor::{Monitor, MonitorGuard, WaitResult};
pub use mutex::{LockOp, LockOutcome, LockState, Mutex, MutexGuard, lock_transition};
pub use platform::backend_name;
pub use thread::{ThreadEntry, ThreadId, ThreadJoinId, ThreadOptions, ThreadState};
pub use tls::{AttachGuard, ThreadLocalDestructor, ThreadLocalKey};
