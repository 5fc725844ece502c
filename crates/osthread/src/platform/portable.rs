//! `std::thread` + `parking_lot` backend.
//!
//! Thread-local slots use a fixed key registry (1024 slots, each with a
//! generation counter) guarded by a leaf lock, plus a per-thread value table
//! held in a `std` thread local. Keys encode `(generation << 32) | index`, so a
//! deleted key is detected on every access by comparing generations.
//!
//! On thread exit, destructors run in rounds of at most
//! [`DESTRUCTOR_ITERATIONS`], as pthread key destructors do. Each round zeroes
//! a value before handing it to its key's destructor. The table stays readable
//! throughout, so a destructor sees other keys' values and may store new ones,
//! which the next round picks up.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Backend, RawCondvar, RawLock, ThreadMain};
use crate::error::{EAGAIN, Resource, ThreadError};
use crate::fault::{self, Fault};
use crate::tls::ThreadLocalDestructor;

pub(crate) struct PortableBackend;

/// Number of simultaneously live thread-local keys.
const KEYS_MAX: usize = 1024;

/// Destructor rounds on thread exit (the POSIX minimum).
pub(crate) const DESTRUCTOR_ITERATIONS: usize = 4;

// ---------------------------------------------------------------------------
// Key registry
// ---------------------------------------------------------------------------

/// Generation per slot. Bumped on create and on delete, so live keys carry an
/// odd generation and every deleted key is stale forever after.
static SLOT_SEQ: [AtomicU32; KEYS_MAX] = [const { AtomicU32::new(0) }; KEYS_MAX];

struct KeyRegistry {
    in_use: [bool; KEYS_MAX],
    destructors: [Option<ThreadLocalDestructor>; KEYS_MAX],
}

impl KeyRegistry {
    const fn new() -> Self {
        Self {
            in_use: [false; KEYS_MAX],
            destructors: [None; KEYS_MAX],
        }
    }
}

static REGISTRY: Mutex<KeyRegistry> = parking_lot::const_mutex(KeyRegistry::new());

const fn encode(index: usize, seq: u32) -> u64 {
    ((seq as u64) << 32) | index as u64
}

const fn decode(key: u64) -> (usize, u32) {
    ((key & 0xFFFF_FFFF) as usize, (key >> 32) as u32)
}

/// Slot index of a live key, or a `StaleKey` fault.
#[inline]
fn live_index(key: u64) -> usize {
    let (index, seq) = decode(key);
    if index >= KEYS_MAX || SLOT_SEQ[index].load(Ordering::Acquire) != seq {
        fault::raise(Fault::StaleKey);
    }
    index
}

// ---------------------------------------------------------------------------
// Per-thread values
// ---------------------------------------------------------------------------

/// Sparse `(key, value)` table for one thread. Keys are full encoded keys, so
/// a value left behind by a deleted key never shows through a reused index.
struct ThreadValues {
    values: RefCell<Vec<(u64, usize)>>,
}

/// Destructor of `key` if the key is still live.
fn live_destructor(key: u64) -> Option<ThreadLocalDestructor> {
    let (index, seq) = decode(key);
    let registry = REGISTRY.lock();
    if SLOT_SEQ[index].load(Ordering::Acquire) == seq {
        registry.destructors[index]
    } else {
        None
    }
}

impl ThreadValues {
    /// Zero every non-zero value whose key has a destructor and return the
    /// pending calls. The borrow ends before any destructor runs.
    fn take_pending(&self) -> Vec<(ThreadLocalDestructor, usize)> {
        let mut values = self.values.borrow_mut();
        let mut pending = Vec::new();
        for (key, value) in values.iter_mut() {
            if *value == 0 {
                continue;
            }
            if let Some(destructor) = live_destructor(*key) {
                pending.push((destructor, mem::take(value)));
            }
        }
        pending
    }
}

impl Drop for ThreadValues {
    fn drop(&mut self) {
        let table: &ThreadValues = self;
        // `VALUES` is no longer reachable while its destructor runs; point
        // key_get/key_set at this table until the rounds are over.
        let _ = TEARDOWN.try_with(|slot| slot.set(ptr::from_ref(table)));
        for _ in 0..DESTRUCTOR_ITERATIONS {
            let pending = table.take_pending();
            if pending.is_empty() {
                break;
            }
            for (destructor, value) in pending {
                // SAFETY: the destructor was registered for this key and gets
                // the value the thread stored, as with pthread key destructors.
                unsafe { destructor(value as *mut c_void) };
            }
        }
        let _ = TEARDOWN.try_with(|slot| slot.set(ptr::null()));
    }
}

thread_local! {
    static VALUES: ThreadValues = const {
        ThreadValues { values: RefCell::new(Vec::new()) }
    };
    /// The exiting thread's table while its destructors run; null otherwise.
    static TEARDOWN: Cell<*const ThreadValues> = const { Cell::new(ptr::null()) };
    static CACHED_ID: Cell<usize> = const { Cell::new(0) };
}

/// Run `f` on the calling thread's value table, if it has one left.
fn with_values<R>(f: impl FnOnce(&RefCell<Vec<(u64, usize)>>) -> R) -> Option<R> {
    match VALUES.try_with(|table| ptr::from_ref(table)) {
        Ok(table) => {
            // SAFETY: `VALUES` is live for this thread while `try_with` succeeds,
            // and nothing below can start its destruction.
            Some(f(unsafe { &(*table).values }))
        }
        Err(_) => {
            let table = TEARDOWN.try_with(Cell::get).ok()?;
            if table.is_null() {
                return None;
            }
            // SAFETY: non-null only inside `ThreadValues::drop` on this thread,
            // which keeps the table alive until it clears the pointer.
            Some(f(unsafe { &(*table).values }))
        }
    }
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Guard-less lock: ownership is tracked by the caller, so guards are
/// forgotten on acquire and the lock is force-unlocked on release.
pub(crate) struct PortableMutex(Mutex<()>);

impl RawLock for PortableMutex {
    fn new() -> Result<Self, ThreadError> {
        Ok(Self(Mutex::new(())))
    }

    fn lock(&self) {
        mem::forget(self.0.lock());
    }

    fn try_lock(&self) -> bool {
        self.0.try_lock().map(mem::forget).is_some()
    }

    unsafe fn unlock(&self) {
        // SAFETY: caller holds the lock acquired by `lock`/`try_lock`.
        unsafe { self.0.force_unlock() };
    }
}

pub(crate) struct PortableCondvar(Condvar);

impl RawCondvar for PortableCondvar {
    type Lock = PortableMutex;

    fn new() -> Result<Self, ThreadError> {
        Ok(Self(Condvar::new()))
    }

    unsafe fn wait(&self, lock: &PortableMutex, timeout: Option<Duration>) -> bool {
        // SAFETY: caller holds `lock`; the rebuilt guard is forgotten so the
        // lock stays held after the wait, as it was before.
        let mut guard = unsafe { lock.0.make_guard_unchecked() };
        let timed_out = match timeout {
            None => {
                self.0.wait(&mut guard);
                false
            }
            Some(timeout) => self.0.wait_for(&mut guard, timeout).timed_out(),
        };
        mem::forget(guard);
        timed_out
    }

    fn notify_one(&self) {
        self.0.notify_one();
    }

    fn notify_all(&self) {
        self.0.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

impl Backend for PortableBackend {
    const NAME: &'static str = "portable";

    type Key = u64;
    type Mutex = PortableMutex;
    type Condvar = PortableCondvar;
    type JoinToken = JoinHandle<()>;

    const UNSET_KEY: u64 = u64::MAX;

    fn key_create(destructor: Option<ThreadLocalDestructor>) -> Result<u64, ThreadError> {
        let mut registry = REGISTRY.lock();
        let Some(index) = registry.in_use.iter().position(|used| !used) else {
            return Err(ThreadError::exhausted(Resource::TlsSlot));
        };
        registry.in_use[index] = true;
        registry.destructors[index] = destructor;
        let seq = SLOT_SEQ[index].fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Ok(encode(index, seq))
    }

    fn key_delete(key: u64) {
        let mut registry = REGISTRY.lock();
        let (index, seq) = decode(key);
        if index >= KEYS_MAX
            || !registry.in_use[index]
            || SLOT_SEQ[index].load(Ordering::Acquire) != seq
        {
            drop(registry);
            fault::raise(Fault::StaleKey);
        }
        registry.in_use[index] = false;
        registry.destructors[index] = None;
        SLOT_SEQ[index].fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    fn key_get(key: u64) -> usize {
        let index = live_index(key);
        with_values(|values| {
            values
                .borrow()
                .iter()
                .find(|(stored, _)| decode(*stored).0 == index)
                .filter(|(stored, _)| *stored == key)
                .map_or(0, |&(_, value)| value)
        })
        .unwrap_or(0)
    }

    fn key_set(key: u64, value: usize) {
        let index = live_index(key);
        with_values(|values| {
            let mut values = values.borrow_mut();
            match values.iter_mut().find(|(stored, _)| decode(*stored).0 == index) {
                Some(slot) => *slot = (key, value),
                None if value != 0 => values.push((key, value)),
                None => {}
            }
        });
    }

    fn current_thread_id() -> usize {
        CACHED_ID
            .try_with(|cached| {
                let id = cached.get();
                if id != 0 {
                    return id;
                }
                let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
                cached.set(id);
                id
            })
            .unwrap_or_else(|_| NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    fn min_stack_size() -> usize {
        16 * 1024
    }

    fn spawn(
        name: Option<String>,
        stack_size: usize,
        main: ThreadMain,
    ) -> Result<JoinHandle<()>, ThreadError> {
        let mut builder = std::thread::Builder::new().stack_size(stack_size);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder
            .spawn(main)
            .map_err(|err| ThreadError::ResourceExhausted {
                resource: Resource::Thread,
                code: err.raw_os_error().unwrap_or(EAGAIN),
            })
    }

    fn join(token: JoinHandle<()>) {
        if token.join().is_err() {
            fault::raise(Fault::Native {
                op: "thread_join",
                code: 0,
            });
        }
    }

    fn detach(token: JoinHandle<()>) {
        drop(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_destroyed(value: *mut c_void) {
        DESTROYED.fetch_add(value as usize, Ordering::SeqCst);
    }

    #[test]
    fn key_encoding_splits_index_and_generation() {
        let key = encode(17, 3);
        assert_eq!(decode(key), (17, 3));
        assert_ne!(key, PortableBackend::UNSET_KEY);
    }

    #[test]
    fn live_keys_have_odd_generation() {
        let key = PortableBackend::key_create(None).unwrap();
        assert_eq!(decode(key).1 % 2, 1);
        PortableBackend::key_delete(key);
    }

    #[test]
    fn value_from_an_older_generation_reads_as_zero() {
        let key = PortableBackend::key_create(None).unwrap();
        let (index, seq) = decode(key);
        VALUES.with(|table| {
            table
                .values
                .borrow_mut()
                .push((encode(index, seq.wrapping_sub(2)), 99));
        });
        assert_eq!(PortableBackend::key_get(key), 0);
        PortableBackend::key_set(key, 7);
        assert_eq!(PortableBackend::key_get(key), 7);
        PortableBackend::key_set(key, 0);
        PortableBackend::key_delete(key);
    }

    #[test]
    fn destructor_runs_on_exit_for_nonzero_values() {
        let key = PortableBackend::key_create(Some(count_destroyed)).unwrap();
        let before = DESTROYED.load(Ordering::SeqCst);
        std::thread::spawn(move || PortableBackend::key_set(key, 5))
            .join()
            .unwrap();
        std::thread::spawn(move || PortableBackend::key_set(key, 0))
            .join()
            .unwrap();
        assert_eq!(DESTROYED.load(Ordering::SeqCst) - before, 5);
        PortableBackend::key_delete(key);
    }

    #[test]
    #[should_panic(expected = "thread-local key was deleted")]
    fn deleted_key_is_detected() {
        crate::config::set_fault_policy(crate::config::FaultPolicy::Panic);
        let key = PortableBackend::key_create(None).unwrap();
        PortableBackend::key_delete(key);
        PortableBackend::key_get(key);
    }
}
