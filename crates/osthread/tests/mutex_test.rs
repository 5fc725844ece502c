use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::time::Duration;

use osthread::Mutex;
use osthread::thread::{self, ThreadOptions};

#[test]
fn contended_counter_never_sees_two_holders() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;

    let mutex = Arc::new(Mutex::new().expect("mutex"));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let ids: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            let total = Arc::clone(&total);
            let start = Arc::clone(&start);
            thread::spawn(ThreadOptions::new(), move || {
                start.wait();
                for _ in 0..ROUNDS {
                    let _guard = mutex.lock();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    // Non-atomic read-modify-write made safe only by the lock.
                    let seen = total.load(Ordering::Relaxed);
                    total.store(seen + 1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .expect("start worker")
        })
        .collect();
    for id in ids {
        thread::join(id);
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(total.load(Ordering::Relaxed), THREADS * ROUNDS);
}

#[test]
fn try_acquire_fails_while_held_elsewhere_then_succeeds_after_release() {
    let mutex = Arc::new(Mutex::new().expect("mutex"));
    let (held_tx, held_rx) = mpsc::channel();
    let release = Arc::new(AtomicBool::new(false));

    let holder = {
        let mutex = Arc::clone(&mutex);
        let release = Arc::clone(&release);
        thread::spawn(ThreadOptions::new().name("holder"), move || {
            mutex.acquire();
            held_tx.send(()).unwrap();
            while !release.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            mutex.release();
        })
        .expect("start holder")
    };

    held_rx.recv().unwrap();
    assert!(!mutex.try_acquire());
    assert!(mutex.owner().is_some());
    assert!(!mutex.is_owned_by_current_thread());

    release.store(true, Ordering::Release);
    thread::join(holder);

    assert!(mutex.try_acquire());
    assert!(mutex.is_owned_by_current_thread());
    mutex.release();
}

#[test]
fn release_happens_before_next_acquire() {
    let mutex = Arc::new(Mutex::new().expect("mutex"));
    let value = Arc::new(AtomicUsize::new(0));

    let guard = mutex.lock();
    let reader = {
        let mutex = Arc::clone(&mutex);
        let value = Arc::clone(&value);
        thread::spawn(ThreadOptions::new(), move || {
            let _guard = mutex.lock();
            assert_eq!(value.load(Ordering::Relaxed), 7);
        })
        .expect("start reader")
    };
    std::thread::sleep(Duration::from_millis(10));
    value.store(7, Ordering::Relaxed);
    drop(guard);
    thread::join(reader);
}
