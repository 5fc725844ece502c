//! Native backend selection.
//!
//! Exactly one backend is compiled in and bound to [`Native`]:
//! - `posix` on Unix targets: pthread keys, mutexes, condition variables and
//!   threads via `libc`.
//! - `portable` on every other target, or on Unix with the `portable-backend`
//!   feature: `std::thread` plus `parking_lot`, with a lock-guarded key
//!   registry for thread-local slots.
//!
//! Callers only ever see the public wrappers in `tls`, `mutex`, `monitor` and
//! `thread`; backend types stay behind private fields. Dispatch is static.

use std::fmt;
use std::time::Duration;

use crate::error::ThreadError;
use crate::tls::ThreadLocalDestructor;

/// Body run on a freshly started native thread.
pub(crate) type ThreadMain = Box<dyn FnOnce() + Send + 'static>;

/// A native mutual-exclusion lock with no ownership tracking of its own.
#[allow(unsafe_code)]
pub(crate) trait RawLock: Send + Sync + Sized {
    fn new() -> Result<Self, ThreadError>;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self);
}

/// A native condition variable paired with one [`RawLock`] type.
#[allow(unsafe_code)]
pub(crate) trait RawCondvar: Send + Sync + Sized {
    type Lock: RawLock;

    fn new() -> Result<Self, ThreadError>;

    /// Atomically release `lock`, block, and re-acquire `lock` before
    /// returning. Returns `true` if the timeout elapsed.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `lock`.
    unsafe fn wait(&self, lock: &Self::Lock, timeout: Option<Duration>) -> bool;

    fn notify_one(&self);

    fn notify_all(&self);
}

/// One native threading family.
pub(crate) trait Backend {
    const NAME: &'static str;

    type Key: Copy + Eq + fmt::Debug + Send + Sync + 'static;
    type Mutex: RawLock;
    type Condvar: RawCondvar<Lock = Self::Mutex>;
    type JoinToken: Send + 'static;

    /// Reserved "no slot allocated" key value.
    const UNSET_KEY: Self::Key;

    fn key_create(destructor: Option<ThreadLocalDestructor>) -> Result<Self::Key, ThreadError>;

    fn key_delete(key: Self::Key);

    /// Calling thread's value for `key`; 0 if never set. Must not block or allocate.
    fn key_get(key: Self::Key) -> usize;

    fn key_set(key: Self::Key, value: usize);

    /// Cheap non-zero identifier of the calling thread.
    fn current_thread_id() -> usize;

    /// Smallest stack the native thread API accepts.
    fn min_stack_size() -> usize;

    fn spawn(
        name: Option<String>,
        stack_size: usize,
        main: ThreadMain,
    ) -> Result<Self::JoinToken, ThreadError>;

    fn join(token: Self::JoinToken);

    fn detach(token: Self::JoinToken);
}

#[cfg(all(unix, not(feature = "portable-backend")))]
#[allow(unsafe_code)]
mod posix;
#[cfg(all(unix, not(feature = "portable-backend")))]
pub(crate) use posix::PosixBackend as Native;

#[cfg(any(not(unix), feature = "portable-backend", test))]
#[allow(unsafe_code)]
mod portable;
#[cfg(any(not(unix), feature = "portable-backend"))]
pub(crate) use portable::PortableBackend as Native;

pub(crate) type NativeKey = <Native as Backend>::Key;
pub(crate) type NativeMutex = <Native as Backend>::Mutex;
pub(crate) type NativeCondvar = <Native as Backend>::Condvar;
pub(crate) type NativeJoinToken = <Native as Backend>::JoinToken;

/// Name of the backend compiled into this build (`"posix"` or `"portable"`).
#[must_use]
pub fn backend_name() -> &'static str {
    <Native as Backend>::NAME
}

/// Contract checks every backend must pass, written against the trait so a
/// new backend only has to instantiate the macro.
#[cfg(test)]
macro_rules! backend_contract_tests {
    ($backend:ty) => {
        use std::ffi::c_void;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, OnceLock};
        use std::time::Duration;

        use $crate::platform::{Backend, RawCondvar, RawLock};

        type B = $backend;
        type M = <B as Backend>::Mutex;
        type C = <B as Backend>::Condvar;

        #[test]
        fn key_values_start_at_zero_and_are_per_thread() {
            let key = B::key_create(None).expect("key_create");
            assert_ne!(key, <B as Backend>::UNSET_KEY);
            assert_eq!(B::key_get(key), 0);
            B::key_set(key, 42);
            assert_eq!(B::key_get(key), 42);

            let seen = std::thread::spawn(move || {
                let before = B::key_get(key);
                B::key_set(key, 7);
                (before, B::key_get(key))
            })
            .join()
            .expect("reader thread");
            assert_eq!(seen, (0, 7));
            assert_eq!(B::key_get(key), 42);

            B::key_set(key, 0);
            B::key_delete(key);
        }

        #[test]
        fn distinct_keys_do_not_alias() {
            let a = B::key_create(None).expect("key a");
            let b = B::key_create(None).expect("key b");
            assert_ne!(a, b);
            B::key_set(a, 1);
            B::key_set(b, 2);
            assert_eq!((B::key_get(a), B::key_get(b)), (1, 2));
            B::key_set(a, 0);
            B::key_set(b, 0);
            B::key_delete(a);
            B::key_delete(b);
        }

        #[test]
        fn thread_ids_are_nonzero_stable_and_distinct() {
            let me = B::current_thread_id();
            assert_ne!(me, 0);
            assert_eq!(me, B::current_thread_id());
            let other = std::thread::spawn(B::current_thread_id)
                .join()
                .expect("id thread");
            assert_ne!(other, 0);
            assert_ne!(other, me);
        }

        #[test]
        fn raw_lock_try_lock_reports_busy() {
            let lock = Arc::new(<M as RawLock>::new().expect("mutex"));
            lock.lock();
            let contender = Arc::clone(&lock);
            let acquired = std::thread::spawn(move || contender.try_lock())
                .join()
                .expect("contender");
            assert!(!acquired);
            // SAFETY: this thread locked it above.
            unsafe { lock.unlock() };
            assert!(lock.try_lock());
            // SAFETY: try_lock succeeded.
            unsafe { lock.unlock() };
        }

        #[test]
        fn condvar_timed_wait_times_out() {
            let lock = <M as RawLock>::new().expect("mutex");
            let cond = <C as RawCondvar>::new().expect("condvar");
            lock.lock();
            let start = std::time::Instant::now();
            // Nobody notifies; anything but a timeout is a spurious wakeup.
            // SAFETY: lock is held by this thread on every iteration.
            while !unsafe { cond.wait(&lock, Some(Duration::from_millis(20))) } {
                assert!(start.elapsed() < Duration::from_secs(5));
            }
            assert!(start.elapsed() >= Duration::from_millis(15));
            // SAFETY: wait re-acquired the lock.
            unsafe { lock.unlock() };
        }

        static OTHER_KEY: OnceLock<<B as Backend>::Key> = OnceLock::new();
        static SEEN_BY_DESTRUCTOR: AtomicUsize = AtomicUsize::new(usize::MAX);

        unsafe extern "C" fn read_other_key(_value: *mut c_void) {
            if let Some(&other) = OTHER_KEY.get() {
                SEEN_BY_DESTRUCTOR.store(B::key_get(other), Ordering::SeqCst);
            }
        }

        #[test]
        fn destructor_sees_other_keys_values() {
            // Native teardown walks slots in order and clears each as it goes,
            // so the key read by the destructor is allocated after it.
            let key = B::key_create(Some(read_other_key)).expect("destructor key");
            let other = B::key_create(None).expect("plain key");
            let _ = OTHER_KEY.set(other);
            std::thread::spawn(move || {
                B::key_set(other, 99);
                B::key_set(key, 1);
            })
            .join()
            .expect("exiting thread");
            assert_eq!(SEEN_BY_DESTRUCTOR.load(Ordering::SeqCst), 99);
            B::key_delete(key);
            B::key_delete(other);
        }

        static RESET_KEY: OnceLock<<B as Backend>::Key> = OnceLock::new();
        static RESET_CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn store_again_once(_value: *mut c_void) {
            let calls = RESET_CALLS.fetch_add(1, Ordering::SeqCst) + 1;
            if calls == 1
                && let Some(&key) = RESET_KEY.get()
            {
                B::key_set(key, 2);
            }
        }

        #[test]
        fn value_stored_by_a_destructor_gets_another_round() {
            let key = B::key_create(Some(store_again_once)).expect("destructor key");
            let _ = RESET_KEY.set(key);
            std::thread::spawn(move || B::key_set(key, 1))
                .join()
                .expect("exiting thread");
            assert_eq!(RESET_CALLS.load(Ordering::SeqCst), 2);
            B::key_delete(key);
        }

        static ZERO_CALLS: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn count_zero_calls(_value: *mut c_void) {
            ZERO_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        #[test]
        fn destructor_skips_zero_values() {
            let key = B::key_create(Some(count_zero_calls)).expect("destructor key");
            std::thread::spawn(move || {
                B::key_set(key, 5);
                B::key_set(key, 0);
            })
            .join()
            .expect("exiting thread");
            assert_eq!(ZERO_CALLS.load(Ordering::SeqCst), 0);
            B::key_delete(key);
        }

        #[test]
        fn key_created_after_a_delete_starts_at_zero() {
            let old = B::key_create(None).expect("first key");
            B::key_set(old, 11);
            B::key_delete(old);
            let fresh = B::key_create(None).expect("second key");
            assert_eq!(B::key_get(fresh), 0);
            B::key_delete(fresh);
        }

        #[test]
        fn spawn_runs_main_and_join_waits_for_it() {
            let ran = Arc::new(AtomicUsize::new(0));
            let flag = Arc::clone(&ran);
            let token = B::spawn(
                Some("contract".to_string()),
                B::min_stack_size().max(256 * 1024),
                Box::new(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    flag.store(1, Ordering::Release);
                }),
            )
            .expect("spawn");
            B::join(token);
            assert_eq!(ran.load(Ordering::Acquire), 1);
        }
    };
}

#[cfg(test)]
#[allow(unsafe_code)]
mod contract {
    backend_contract_tests!(crate::platform::Native);
}

/// The portable backend builds on every target, so its contract runs even
/// when posix is the selected backend.
#[cfg(all(test, unix, not(feature = "portable-backend")))]
#[allow(unsafe_code)]
mod portable_contract {
    backend_contract_tests!(crate::platform::portable::PortableBackend);
}
