//! Non-reentrant mutual exclusion.
//!
//! [`Mutex`] wraps the backend's native lock with an owner word so misuse is
//! caught instead of deadlocking or corrupting the native object. Every fault
//! decision goes through [`lock_transition`], the contract table shared with
//! [`crate::monitor::Monitor`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::fault::{self, Fault};
use crate::platform::{NativeMutex, RawLock};
use crate::thread::{self, ThreadId};

// ---------------------------------------------------------------------------
// Contract table
// ---------------------------------------------------------------------------

/// Lock state as seen from the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Unlocked,
    HeldBySelf,
    HeldByOther,
}

/// Operations that consult the contract table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOp {
    Acquire,
    TryAcquire,
    Release,
    /// `Monitor::wait`.
    Wait,
    /// `Monitor::notify_one` / `notify_all`.
    Notify,
}

/// Result of applying a [`LockOp`] in a [`LockState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOutcome {
    /// State after the operation completes.
    pub next: LockState,
    /// The operation may wait for progress by another thread.
    pub blocks: bool,
    /// The caller ends up holding a lock it did not hold before.
    pub acquires: bool,
    /// Contract violation raised instead of performing the operation.
    pub fault: Option<Fault>,
}

const fn ok(next: LockState, blocks: bool, acquires: bool) -> LockOutcome {
    LockOutcome {
        next,
        blocks,
        acquires,
        fault: None,
    }
}

const fn violation(state: LockState, fault: Fault) -> LockOutcome {
    LockOutcome {
        next: state,
        blocks: false,
        acquires: false,
        fault: Some(fault),
    }
}

/// Contract transition for the non-reentrant lock shared by `Mutex` and
/// `Monitor`.
#[must_use]
pub const fn lock_transition(state: LockState, op: LockOp) -> LockOutcome {
    use LockOp as Op;
    use LockState as St;

    match (state, op) {
        (St::Unlocked, Op::Acquire | Op::TryAcquire) => ok(St::HeldBySelf, false, true),
        (St::HeldByOther, Op::Acquire) => ok(St::HeldBySelf, true, true),
        (St::HeldByOther, Op::TryAcquire) => ok(St::HeldByOther, false, false),
        (St::HeldBySelf, Op::Acquire) => violation(state, Fault::RecursiveAcquire),
        // A holder probing its own lock just learns it is busy.
        (St::HeldBySelf, Op::TryAcquire) => ok(St::HeldBySelf, false, false),

        (St::HeldBySelf, Op::Release) => ok(St::Unlocked, false, false),
        (St::Unlocked | St::HeldByOther, Op::Release) => violation(state, Fault::ReleaseNotOwner),

        (St::HeldBySelf, Op::Wait) => ok(St::HeldBySelf, true, false),
        (St::Unlocked | St::HeldByOther, Op::Wait) => violation(state, Fault::WaitWithoutLock),

        (St::HeldBySelf, Op::Notify) => ok(St::HeldBySelf, false, false),
        (St::Unlocked | St::HeldByOther, Op::Notify) => violation(state, Fault::NotifyWithoutLock),
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Exclusive, non-reentrant lock.
pub struct Mutex {
    raw: NativeMutex,
    /// `ThreadId` of the holder, 0 when unlocked. Only the holder writes its
    /// own id, so `owner == me` is exact even with relaxed loads.
    owner: AtomicUsize,
}

impl Mutex {
    /// # Errors
    ///
    /// `ResourceExhausted` (resource `SyncObject`) if the OS refuses a native
    /// mutex.
    pub fn new() -> Result<Self> {
        Ok(Self {
            raw: NativeMutex::new()?,
            owner: AtomicUsize::new(0),
        })
    }

    pub(crate) fn state_for(&self, me: ThreadId) -> LockState {
        match self.owner.load(Ordering::Relaxed) {
            0 => LockState::Unlocked,
            owner if owner == me.as_usize() => LockState::HeldBySelf,
            _ => LockState::HeldByOther,
        }
    }

    /// Apply `op` to the table for the calling thread, raising any fault.
    #[track_caller]
    pub(crate) fn check(&self, me: ThreadId, op: LockOp) -> LockOutcome {
        let outcome = lock_transition(self.state_for(me), op);
        if let Some(fault) = outcome.fault {
            fault::raise(fault);
        }
        outcome
    }

    pub(crate) fn raw(&self) -> &NativeMutex {
        &self.raw
    }

    pub(crate) fn set_owner(&self, owner: ThreadId) {
        self.owner.store(owner.as_usize(), Ordering::Relaxed);
    }

    /// Block until the lock is held by the calling thread.
    #[track_caller]
    pub fn acquire(&self) {
        let me = thread::current_id();
        self.check(me, LockOp::Acquire);
        self.raw.lock();
        self.set_owner(me);
    }

    /// Take the lock if it is free. Returns `false` when another thread holds
    /// it, and also when the calling thread already does.
    #[track_caller]
    pub fn try_acquire(&self) -> bool {
        let me = thread::current_id();
        let outcome = self.check(me, LockOp::TryAcquire);
        if outcome.next == LockState::HeldBySelf && !outcome.acquires {
            return false;
        }
        if self.raw.try_lock() {
            self.set_owner(me);
            true
        } else {
            false
        }
    }

    /// Release a lock held by the calling thread.
    #[track_caller]
    #[allow(unsafe_code)]
    pub fn release(&self) {
        let me = thread::current_id();
        self.check(me, LockOp::Release);
        self.set_owner(ThreadId::INVALID);
        // SAFETY: the contract check proved this thread is the holder.
        unsafe { self.raw.unlock() };
    }

    /// Acquire and return a guard that releases on drop.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_> {
        self.acquire();
        MutexGuard::new(self)
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.try_acquire().then(|| MutexGuard::new(self))
    }

    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state_for(thread::current_id()) == LockState::HeldBySelf
    }

    /// Current holder. Advisory for any thread but the holder itself.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_usize(self.owner.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("owner", &self.owner()).finish()
    }
}

/// Scoped hold on a [`Mutex`]. Released on drop, including during unwinding.
/// Not `Send`: the lock must be released by the thread that took it.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MutexGuard<'a> {
    fn new(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}
