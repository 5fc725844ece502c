//! Monitors: a [`Mutex`] paired with a condition variable.
//!
//! Waiting and notifying both require holding the monitor. Wakeups may be
//! spurious, so waiters re-check their condition in a loop:
//!
//! ```
//! # use osthread::Monitor;
//! # use std::sync::atomic::{AtomicBool, Ordering};
//! # let monitor = Monitor::new().unwrap();
//! # let ready = AtomicBool::new(true);
//! let guard = monitor.lock();
//! while !ready.load(Ordering::Relaxed) {
//!     guard.wait(None);
//! }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::Result;
use crate::mutex::{LockOp, Mutex};
use crate::platform::{NativeCondvar, RawCondvar, RawLock};
use crate::thread::{self, ThreadId};

/// How a [`Monitor::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// Woken by a notify, or spuriously.
    Notified,
    /// The timeout elapsed first.
    TimedOut,
}

impl WaitResult {
    #[must_use]
    pub fn timed_out(self) -> bool {
        self == Self::TimedOut
    }
}

/// Mutual exclusion plus wait/notify.
pub struct Monitor {
    mutex: Mutex,
    cond: NativeCondvar,
}

impl Monitor {
    /// # Errors
    ///
    /// `ResourceExhausted` (resource `SyncObject`) if the OS refuses the
    /// native mutex or condition variable.
    pub fn new() -> Result<Self> {
        Ok(Self {
            mutex: Mutex::new()?,
            cond: NativeCondvar::new()?,
        })
    }

    #[track_caller]
    pub fn enter(&self) {
        self.mutex.acquire();
    }

    #[track_caller]
    pub fn try_enter(&self) -> bool {
        self.mutex.try_acquire()
    }

    #[track_caller]
    pub fn exit(&self) {
        self.mutex.release();
    }

    #[track_caller]
    pub fn lock(&self) -> MonitorGuard<'_> {
        self.enter();
        MonitorGuard::new(self)
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<MonitorGuard<'_>> {
        self.try_enter().then(|| MonitorGuard::new(self))
    }

    /// Release the monitor, block until notified or `timeout` elapses, and
    /// re-acquire before returning. `None` waits without a deadline.
    #[track_caller]
    #[allow(unsafe_code)]
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let me = thread::current_id();
        self.mutex.check(me, LockOp::Wait);

        self.mutex.set_owner(ThreadId::INVALID);
        let raw = self.mutex.raw();
        let timed_out = match timeout {
            Some(timeout) if timeout.is_zero() => {
                // Give other threads a window on the lock, then time out.
                // SAFETY: the contract check proved this thread holds it.
                unsafe { raw.unlock() };
                raw.lock();
                true
            }
            // SAFETY: as above; the native wait re-acquires before returning.
            _ => unsafe { self.cond.wait(raw, timeout) },
        };
        self.mutex.set_owner(me);

        if timed_out {
            WaitResult::TimedOut
        } else {
            WaitResult::Notified
        }
    }

    /// Wake at most one waiter.
    #[track_caller]
    pub fn notify_one(&self) {
        self.mutex.check(thread::current_id(), LockOp::Notify);
        self.cond.notify_one();
    }

    /// Wake every current waiter.
    #[track_caller]
    pub fn notify_all(&self) {
        self.mutex.check(thread::current_id(), LockOp::Notify);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread()
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("owner", &self.mutex.owner())
            .finish_non_exhaustive()
    }
}

/// Scoped hold on a [`Monitor`]; exits on drop. Not `Send`.
#[must_use = "dropping the guard exits the monitor immediately"]
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MonitorGuard<'a> {
    fn new(monitor: &'a Monitor) -> Self {
        Self {
            monitor,
            _not_send: PhantomData,
        }
    }

    #[track_caller]
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        self.monitor.wait(timeout)
    }

    #[track_caller]
    pub fn notify_one(&self) {
        self.monitor.notify_one();
    }

    #[track_caller]
    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }

    #[must_use]
    pub fn monitor(&self) -> &'a Monitor {
        self.monitor
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.exit();
    }
}

impl fmt::Debug for MonitorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorGuard").finish_non_exhaustive()
    }
}
