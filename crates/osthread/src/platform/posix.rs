//! pthread backend.
//!
//! Keys, mutexes, condition variables and threads map one-to-one onto their
//! libc counterparts. Mutexes are created with `PTHREAD_MUTEX_NORMAL`; the
//! owner check that makes them non-reentrant lives in `crate::mutex`.

use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::time::Duration;

use super::{Backend, RawCondvar, RawLock, ThreadMain};
use crate::error::{Resource, ThreadError};
use crate::fault::{self, Fault};
use crate::tls::ThreadLocalDestructor;

pub(crate) struct PosixBackend;

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Boxed so the pthread object never moves after `pthread_mutex_init`.
pub(crate) struct PosixMutex(Box<UnsafeCell<libc::pthread_mutex_t>>);

// SAFETY: pthread mutexes are designed to be shared between threads; the
// object is only touched through pthread calls.
unsafe impl Send for PosixMutex {}
unsafe impl Sync for PosixMutex {}

impl PosixMutex {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.0.get()
    }
}

impl RawLock for PosixMutex {
    fn new() -> Result<Self, ThreadError> {
        let mutex = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is initialized by pthread_mutexattr_init before any
        // other use and destroyed before it goes out of scope.
        unsafe {
            let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(ThreadError::from_errno(
                    "pthread_mutexattr_init",
                    Resource::SyncObject,
                    rc,
                ));
            }
            let rc = libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_NORMAL);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                return Err(ThreadError::from_errno(
                    "pthread_mutexattr_settype",
                    Resource::SyncObject,
                    rc,
                ));
            }
            let rc = libc::pthread_mutex_init(mutex.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(ThreadError::from_errno(
                    "pthread_mutex_init",
                    Resource::SyncObject,
                    rc,
                ));
            }
        }
        Ok(Self(mutex))
    }

    fn lock(&self) {
        // SAFETY: initialized in `new`, destroyed only in `drop`.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        fault::check_native("pthread_mutex_lock", rc);
    }

    fn try_lock(&self) -> bool {
        // SAFETY: as for `lock`.
        match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
            0 => true,
            libc::EBUSY => false,
            rc => fault::raise(Fault::Native {
                op: "pthread_mutex_trylock",
                code: rc,
            }),
        }
    }

    unsafe fn unlock(&self) {
        // SAFETY: caller holds the lock.
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        fault::check_native("pthread_mutex_unlock", rc);
    }
}

impl Drop for PosixMutex {
    fn drop(&mut self) {
        // EBUSY here means a guard leaked; the object is dropped regardless.
        // SAFETY: no other reference exists once drop runs.
        unsafe { libc::pthread_mutex_destroy(self.raw()) };
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

pub(crate) struct PosixCondvar(Box<UnsafeCell<libc::pthread_cond_t>>);

// SAFETY: see PosixMutex.
unsafe impl Send for PosixCondvar {}
unsafe impl Sync for PosixCondvar {}

impl PosixCondvar {
    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.0.get()
    }
}

/// Absolute `WAIT_CLOCK` deadline `timeout` from now, saturating far in the future.
fn deadline_after(timeout: Duration) -> libc::timespec {
    const NANOS_PER_SEC: i64 = 1_000_000_000;

    // SAFETY: timespec is plain data; all-zero is a valid value.
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: `now` is a valid out-pointer.
    unsafe { libc::clock_gettime(WAIT_CLOCK, &mut now) };

    let nanos = i64::from(now.tv_nsec) + i64::from(timeout.subsec_nanos());
    let secs = i64::from(now.tv_sec)
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX))
        .saturating_add(nanos / NANOS_PER_SEC);

    // SAFETY: as above.
    let mut deadline: libc::timespec = unsafe { mem::zeroed() };
    deadline.tv_sec = libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX);
    deadline.tv_nsec = (nanos % NANOS_PER_SEC) as _;
    deadline
}

impl RawCondvar for PosixCondvar {
    type Lock = PosixMutex;

    fn new() -> Result<Self, ThreadError> {
        let cond = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr is initialized before use and destroyed before return.
        unsafe {
            let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(ThreadError::from_errno(
                    "pthread_condattr_init",
                    Resource::SyncObject,
                    rc,
                ));
            }
            #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            {
                let rc = libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK);
                if rc != 0 {
                    libc::pthread_condattr_destroy(attr.as_mut_ptr());
                    return Err(ThreadError::from_errno(
                        "pthread_condattr_setclock",
                        Resource::SyncObject,
                        rc,
                    ));
                }
            }
            let rc = libc::pthread_cond_init(cond.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(ThreadError::from_errno(
                    "pthread_cond_init",
                    Resource::SyncObject,
                    rc,
                ));
            }
        }
        Ok(Self(cond))
    }

    unsafe fn wait(&self, lock: &PosixMutex, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                // SAFETY: caller holds `lock`.
                let rc = unsafe { libc::pthread_cond_wait(self.raw(), lock.raw()) };
                fault::check_native("pthread_cond_wait", rc);
                false
            }
            Some(timeout) => {
                let deadline = deadline_after(timeout);
                // SAFETY: caller holds `lock`; deadline lives across the call.
                match unsafe { libc::pthread_cond_timedwait(self.raw(), lock.raw(), &deadline) } {
                    0 => false,
                    libc::ETIMEDOUT => true,
                    rc => fault::raise(Fault::Native {
                        op: "pthread_cond_timedwait",
                        code: rc,
                    }),
                }
            }
        }
    }

    fn notify_one(&self) {
        // SAFETY: initialized in `new`.
        let rc = unsafe { libc::pthread_cond_signal(self.raw()) };
        fault::check_native("pthread_cond_signal", rc);
    }

    fn notify_all(&self) {
        // SAFETY: initialized in `new`.
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw()) };
        fault::check_native("pthread_cond_broadcast", rc);
    }
}

impl Drop for PosixCondvar {
    fn drop(&mut self) {
        // SAFETY: no other reference exists once drop runs.
        unsafe { libc::pthread_cond_destroy(self.raw()) };
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

pub(crate) struct PosixJoin(libc::pthread_t);

// SAFETY: a pthread_t may be joined or detached from any thread.
unsafe impl Send for PosixJoin {}

extern "C" fn thread_start(payload: *mut c_void) -> *mut c_void {
    // SAFETY: payload is the Box::into_raw from `spawn`, handed over exactly once.
    let main = unsafe { Box::from_raw(payload.cast::<ThreadMain>()) };
    main();
    ptr::null_mut()
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page).ok().filter(|&p| p > 0).unwrap_or(4096)
}

/// Longest prefix of `name` that fits in `max` bytes without splitting a char.
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android", target_vendor = "apple")),
    allow(dead_code)
)]
fn truncate_name(name: &str, max: usize) -> &str {
    let mut end = name.len().min(max);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Best effort: failures leave the kernel-visible name unchanged.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_current_name(name: &str) {
    // TASK_COMM_LEN is 16 including the NUL.
    if let Ok(name) = std::ffi::CString::new(truncate_name(name, 15)) {
        // SAFETY: valid C string; pthread_self is always a live thread.
        unsafe { libc::pthread_setname_np(libc::pthread_self(), name.as_ptr()) };
    }
}

#[cfg(target_vendor = "apple")]
fn set_current_name(name: &str) {
    if let Ok(name) = std::ffi::CString::new(truncate_name(name, 63)) {
        // SAFETY: valid C string; Apple only names the calling thread.
        unsafe { libc::pthread_setname_np(name.as_ptr()) };
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
fn set_current_name(_name: &str) {}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn os_thread_id() -> usize {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn os_thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

thread_local! {
    static CACHED_ID: Cell<usize> = const { Cell::new(0) };
}

impl Backend for PosixBackend {
    const NAME: &'static str = "posix";

    type Key = libc::pthread_key_t;
    type Mutex = PosixMutex;
    type Condvar = PosixCondvar;
    type JoinToken = PosixJoin;

    const UNSET_KEY: libc::pthread_key_t = libc::pthread_key_t::MAX;

    fn key_create(destructor: Option<ThreadLocalDestructor>) -> Result<Self::Key, ThreadError> {
        let mut key: libc::pthread_key_t = 0;
        // SAFETY: `key` is a valid out-pointer.
        let rc = unsafe { libc::pthread_key_create(&mut key, destructor) };
        if rc != 0 {
            return Err(ThreadError::from_errno(
                "pthread_key_create",
                Resource::TlsSlot,
                rc,
            ));
        }
        if key == Self::UNSET_KEY {
            // The sentinel is reserved; take another and give this one back.
            let retry = Self::key_create(destructor);
            // SAFETY: `key` was just created and has no values yet.
            unsafe { libc::pthread_key_delete(key) };
            return retry;
        }
        Ok(key)
    }

    fn key_delete(key: Self::Key) {
        // SAFETY: pthread_key_delete validates the key itself.
        if unsafe { libc::pthread_key_delete(key) } != 0 {
            fault::raise(Fault::StaleKey);
        }
    }

    #[inline]
    fn key_get(key: Self::Key) -> usize {
        // SAFETY: returns null for keys this thread never set.
        unsafe { libc::pthread_getspecific(key) as usize }
    }

    fn key_set(key: Self::Key, value: usize) {
        // SAFETY: the value is stored as an opaque word, never dereferenced here.
        let rc = unsafe { libc::pthread_setspecific(key, value as *const c_void) };
        fault::check_native("pthread_setspecific", rc);
    }

    fn current_thread_id() -> usize {
        CACHED_ID
            .try_with(|cached| {
                let id = cached.get();
                if id != 0 {
                    return id;
                }
                let id = os_thread_id();
                cached.set(id);
                id
            })
            .unwrap_or_else(|_| os_thread_id())
    }

    fn min_stack_size() -> usize {
        libc::PTHREAD_STACK_MIN
    }

    fn spawn(
        name: Option<String>,
        stack_size: usize,
        main: ThreadMain,
    ) -> Result<Self::JoinToken, ThreadError> {
        let main: ThreadMain = match name {
            Some(name) => Box::new(move || {
                set_current_name(&name);
                main();
            }),
            None => main,
        };
        let stack_size = stack_size
            .max(Self::min_stack_size())
            .next_multiple_of(page_size());

        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        // SAFETY: attr is initialized before use and destroyed on every path.
        unsafe {
            let rc = libc::pthread_attr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(ThreadError::from_errno(
                    "pthread_attr_init",
                    Resource::Thread,
                    rc,
                ));
            }
            // EINVAL means the size was refused; the default stack is used instead.
            let _ = libc::pthread_attr_setstacksize(attr.as_mut_ptr(), stack_size);

            let payload = Box::into_raw(Box::new(main));
            let mut native: libc::pthread_t = mem::zeroed();
            let rc = libc::pthread_create(
                &mut native,
                attr.as_ptr(),
                thread_start,
                payload.cast::<c_void>(),
            );
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                // The thread never started, so the payload is still ours.
                drop(Box::from_raw(payload));
                return Err(ThreadError::from_errno("pthread_create", Resource::Thread, rc));
            }
            Ok(PosixJoin(native))
        }
    }

    fn join(token: Self::JoinToken) {
        // SAFETY: the token is consumed, so the thread is joined at most once.
        let rc = unsafe { libc::pthread_join(token.0, ptr::null_mut()) };
        fault::check_native("pthread_join", rc);
    }

    fn detach(token: Self::JoinToken) {
        // SAFETY: as for `join`.
        let rc = unsafe { libc::pthread_detach(token.0) };
        fault::check_native("pthread_detach", rc);
    }
}
