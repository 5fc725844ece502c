#![allow(unsafe_code)]

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};

use osthread::thread::{self, ThreadOptions};
use osthread::ThreadLocalKey;

#[test]
fn value_set_on_one_thread_is_invisible_to_another() {
    let key = ThreadLocalKey::allocate().expect("allocate key");
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();

    // Thread A sets 42 and keeps it until B has looked.
    let a = {
        let barrier = Arc::clone(&barrier);
        let tx = tx.clone();
        thread::spawn(ThreadOptions::new().name("tls-a"), move || {
            key.set(42);
            barrier.wait();
            barrier.wait();
            tx.send(("a", key.get())).unwrap();
            key.set(0);
        })
        .expect("start A")
    };
    let b = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(ThreadOptions::new().name("tls-b"), move || {
            barrier.wait();
            tx.send(("b", key.get())).unwrap();
            barrier.wait();
        })
        .expect("start B")
    };

    thread::join(b);
    thread::join(a);
    let mut seen: Vec<_> = rx.iter().collect();
    seen.sort();
    assert_eq!(seen, vec![("a", 42), ("b", 0)]);
    key.delete();
}

#[test]
fn many_threads_keep_independent_values() {
    let key = ThreadLocalKey::allocate().expect("allocate key");
    let mismatches = Arc::new(AtomicUsize::new(0));
    let ids: Vec<_> = (1..=16usize)
        .map(|n| {
            let mismatches = Arc::clone(&mismatches);
            thread::spawn(ThreadOptions::new(), move || {
                assert_eq!(key.get(), 0);
                for round in 0..1000 {
                    key.set(n * 10_000 + round);
                    if key.get() != n * 10_000 + round {
                        mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                }
                key.set(0);
            })
            .expect("start worker")
        })
        .collect();
    for id in ids {
        thread::join(id);
    }
    assert_eq!(mismatches.load(Ordering::Relaxed), 0);
    key.delete();
}

static DESTROYED_SUM: AtomicUsize = AtomicUsize::new(0);
static DESTROYED_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn record_destroyed(value: *mut c_void) {
    DESTROYED_SUM.fetch_add(value as usize, Ordering::SeqCst);
    DESTROYED_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn destructor_runs_only_for_nonzero_values() {
    let key = ThreadLocalKey::allocate_with_destructor(record_destroyed).expect("allocate key");

    let with_value = thread::spawn(ThreadOptions::new(), move || key.set(40)).unwrap();
    thread::join(with_value);
    let cleared = thread::spawn(ThreadOptions::new(), move || {
        key.set(2);
        key.set(0);
    })
    .unwrap();
    thread::join(cleared);
    let attached = thread::spawn(ThreadOptions::new(), move || {
        let _ctx = key.attach(1000);
    })
    .unwrap();
    thread::join(attached);

    assert_eq!(DESTROYED_SUM.load(Ordering::SeqCst), 40);
    assert_eq!(DESTROYED_CALLS.load(Ordering::SeqCst), 1);
    key.delete();
}

static CONTEXT_KEY: std::sync::OnceLock<ThreadLocalKey> = std::sync::OnceLock::new();

/// Runtime-style entry: attach the context first, detach before returning.
fn context_entry(context: usize) {
    let key = *CONTEXT_KEY.get().expect("context key");
    let _attached = key.attach(context);
    assert_eq!(current_context(), context);
}

fn current_context() -> usize {
    CONTEXT_KEY.get().map_or(0, |key| key.get())
}

#[test]
fn entry_routines_attach_and_detach_context() {
    let key = ThreadLocalKey::allocate().expect("allocate key");
    CONTEXT_KEY.set(key).expect("set once");

    let ids: Vec<_> = (1..=4)
        .map(|n| thread::start(context_entry, 0x1000 * n, Some("ctx-worker"), 0).unwrap())
        .collect();
    for id in ids {
        thread::join(id);
    }
    assert_eq!(current_context(), 0);
}
