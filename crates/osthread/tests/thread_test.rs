use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use osthread::thread::{self, MAX_STACK_SIZE, MIN_STACK_SIZE, ThreadOptions};
use osthread::{ThreadId, ThreadState};

static SLOW_DONE: AtomicBool = AtomicBool::new(false);

fn slow_entry(delay_ms: usize) {
    std::thread::sleep(Duration::from_millis(delay_ms as u64));
    SLOW_DONE.store(true, Ordering::SeqCst);
}

#[test]
fn join_returns_only_after_entry_returns() {
    let id = thread::start(slow_entry, 30, Some("slow"), 0).expect("start");
    thread::join(id);
    assert!(SLOW_DONE.load(Ordering::SeqCst));
}

#[test]
fn explicit_stack_hint_is_usable() {
    // Deep-ish recursion that would not fit in the minimum stack.
    fn depth(n: usize) -> usize {
        let pad = [n as u8; 512];
        if n == 0 {
            usize::from(pad[0])
        } else {
            depth(n - 1) + usize::from(std::hint::black_box(pad)[1] == 0)
        }
    }

    let result = Arc::new(AtomicUsize::new(0));
    let out = Arc::clone(&result);
    let id = thread::spawn(
        ThreadOptions::new().name("deep").stack_size(8 * 1024 * 1024),
        move || out.store(depth(2_000) + 1, Ordering::SeqCst),
    )
    .expect("spawn");
    thread::join(id);
    assert!(result.load(Ordering::SeqCst) > 0);
}

#[test]
fn tiny_and_huge_hints_are_clamped() {
    assert!(thread::clamp_stack_size(1) >= MIN_STACK_SIZE);
    assert_eq!(thread::clamp_stack_size(usize::MAX), MAX_STACK_SIZE);
    let id = thread::start(|_| {}, 0, None, 1).expect("tiny hint still starts");
    thread::join(id);
}

#[test]
fn thread_ids_differ_between_threads() {
    let ids = Arc::new(Mutex::new(Vec::new()));
    let started: Vec<_> = (0..8)
        .map(|_| {
            let ids = Arc::clone(&ids);
            thread::spawn(ThreadOptions::new(), move || {
                ids.lock().unwrap().push(thread::current_id());
            })
            .expect("spawn")
        })
        .collect();
    for id in started {
        thread::join(id);
    }
    let mut ids = ids.lock().unwrap().clone();
    ids.push(thread::current_id());
    assert!(ids.iter().all(|&id| id != ThreadId::INVALID));
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 9);
}

#[test]
fn detached_thread_runs_to_completion() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let id = thread::spawn(ThreadOptions::new().name("detached"), move || {
        std::thread::sleep(Duration::from_millis(10));
        flag.store(true, Ordering::SeqCst);
    })
    .expect("spawn");
    thread::detach(id);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "detached thread never finished");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn state_is_finished_before_join() {
    let id = thread::spawn(ThreadOptions::new(), || {}).expect("spawn");
    let deadline = Instant::now() + Duration::from_secs(5);
    while thread::state_of(&id) != ThreadState::Finished {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(thread::thread_id_of(&id).is_some());
    thread::join(id);
}
