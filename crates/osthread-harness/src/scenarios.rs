//! Multi-threaded scenarios run against the compiled backend.
//!
//! Each scenario returns its operation counters on success. Worker threads
//! never panic on a failed check; they record it and the scenario reports
//! `ScenarioFailed` after joining them.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use osthread::thread::{self, ThreadJoinId, ThreadOptions};
use osthread::{Monitor, Mutex, ThreadError, ThreadLocalKey, WaitResult};

use crate::error::HarnessError;

pub type OpCounts = Vec<(&'static str, u64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    TlsIsolation,
    MutexExclusion,
    TryAcquireHandoff,
    MonitorWakeup,
    TimedWait,
    JoinLifecycle,
    DetachLifecycle,
}

impl Scenario {
    pub const ALL: [Self; 7] = [
        Self::TlsIsolation,
        Self::MutexExclusion,
        Self::TryAcquireHandoff,
        Self::MonitorWakeup,
        Self::TimedWait,
        Self::JoinLifecycle,
        Self::DetachLifecycle,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TlsIsolation => "tls_isolation",
            Self::MutexExclusion => "mutex_exclusion",
            Self::TryAcquireHandoff => "try_acquire_handoff",
            Self::MonitorWakeup => "monitor_wakeup",
            Self::TimedWait => "timed_wait",
            Self::JoinLifecycle => "join_lifecycle",
            Self::DetachLifecycle => "detach_lifecycle",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::TlsIsolation => "a value set on one thread is invisible to another",
            Self::MutexExclusion => "contended increments under a mutex are never lost",
            Self::TryAcquireHandoff => "try_acquire fails while held and succeeds after release",
            Self::MonitorWakeup => "10 notifiers each release one of 10 waiters",
            Self::TimedWait => "an unnotified timed wait returns TimedOut with the lock held",
            Self::JoinLifecycle => "join returns only after the entry has finished",
            Self::DetachLifecycle => "a detached thread runs to completion",
        }
    }

    /// Run the scenario once.
    ///
    /// # Errors
    ///
    /// `ScenarioFailed` when an observed behavior is wrong, `Thread` when the
    /// OS refuses a thread or sync object.
    pub fn run(self) -> Result<OpCounts, HarnessError> {
        match self {
            Self::TlsIsolation => tls_isolation(),
            Self::MutexExclusion => mutex_exclusion(),
            Self::TryAcquireHandoff => try_acquire_handoff(),
            Self::MonitorWakeup => monitor_wakeup(),
            Self::TimedWait => timed_wait(),
            Self::JoinLifecycle => join_lifecycle(),
            Self::DetachLifecycle => detach_lifecycle(),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| HarnessError::UnknownScenario(s.to_string()))
    }
}

fn named(scenario: Scenario, role: &str) -> ThreadOptions {
    ThreadOptions::new().name(format!("{}-{role}", scenario.name()))
}

fn join_all(ids: Vec<ThreadJoinId>) {
    for id in ids {
        thread::join(id);
    }
}

const GATE_CLOSED: u8 = 0;
const GATE_OPEN: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Start line for a scenario's workers. Opened once every worker has been
/// spawned, or cancelled when a spawn fails so the workers already running
/// return and can be joined.
struct StartGate {
    monitor: Monitor,
    state: AtomicU8,
}

impl StartGate {
    fn new() -> Result<Arc<Self>, HarnessError> {
        Ok(Arc::new(Self {
            monitor: Monitor::new()?,
            state: AtomicU8::new(GATE_CLOSED),
        }))
    }

    /// Block until the gate opens. `false` means the run was cancelled.
    fn pass(&self) -> bool {
        let guard = self.monitor.lock();
        while self.state.load(Ordering::Relaxed) == GATE_CLOSED {
            guard.wait(None);
        }
        self.state.load(Ordering::Relaxed) == GATE_OPEN
    }

    fn release(&self, state: u8) {
        let guard = self.monitor.lock();
        self.state.store(state, Ordering::Relaxed);
        guard.notify_all();
    }

    fn open(&self) {
        self.release(GATE_OPEN);
    }

    /// Cancel, join the workers already started, and pass `err` on.
    fn abandon(&self, started: Vec<ThreadJoinId>, err: ThreadError) -> HarnessError {
        self.release(GATE_CANCELLED);
        join_all(started);
        err.into()
    }
}

/// Thread A stores 42 under K; thread B, started after, still reads 0.
fn tls_isolation() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::TlsIsolation;

    let key = ThreadLocalKey::allocate()?;
    let gate = StartGate::new()?;
    let stored = Arc::new(Barrier::new(2));
    let checked = Arc::new(Barrier::new(2));
    let seen_a = Arc::new(AtomicUsize::new(usize::MAX));
    let seen_b = Arc::new(AtomicUsize::new(usize::MAX));

    let a = {
        let (gate, stored, checked, seen) = (
            Arc::clone(&gate),
            Arc::clone(&stored),
            Arc::clone(&checked),
            Arc::clone(&seen_a),
        );
        thread::spawn(named(SCENARIO, "a"), move || {
            if !gate.pass() {
                return;
            }
            key.set(42);
            stored.wait();
            checked.wait();
            seen.store(key.get(), Ordering::SeqCst);
            key.set(0);
        })
    };
    let a = match a {
        Ok(id) => id,
        Err(err) => {
            key.delete();
            return Err(err.into());
        }
    };
    let b = {
        let (gate, stored, checked, seen) = (
            Arc::clone(&gate),
            Arc::clone(&stored),
            Arc::clone(&checked),
            Arc::clone(&seen_b),
        );
        thread::spawn(named(SCENARIO, "b"), move || {
            if !gate.pass() {
                return;
            }
            stored.wait();
            seen.store(key.get(), Ordering::SeqCst);
            checked.wait();
        })
    };
    let b = match b {
        Ok(id) => id,
        Err(err) => {
            let err = gate.abandon(vec![a], err);
            key.delete();
            return Err(err);
        }
    };
    gate.open();
    join_all(vec![a, b]);
    let main_value = key.get();
    key.delete();

    let (a, b) = (seen_a.load(Ordering::SeqCst), seen_b.load(Ordering::SeqCst));
    if a != 42 || b != 0 || main_value != 0 {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("expected A=42, B=0, main=0; got A={a}, B={b}, main={main_value}"),
        ));
    }
    Ok(vec![("threads", 2), ("sets", 2), ("gets", 3)])
}

/// Non-atomic read-modify-write under the mutex from several threads.
fn mutex_exclusion() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::MutexExclusion;
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 2_000;

    let mutex = Arc::new(Mutex::new()?);
    let gate = StartGate::new()?;
    let counter = Arc::new(AtomicU64::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let inside = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for n in 0..THREADS {
        let (mutex, gate_t, counter, overlap, inside) = (
            Arc::clone(&mutex),
            Arc::clone(&gate),
            Arc::clone(&counter),
            Arc::clone(&overlap),
            Arc::clone(&inside),
        );
        let spawned = thread::spawn(named(SCENARIO, &n.to_string()), move || {
            if !gate_t.pass() {
                return;
            }
            for _ in 0..ROUNDS {
                let _held = mutex.lock();
                if inside.fetch_add(1, Ordering::Relaxed) != 0 {
                    overlap.store(true, Ordering::Relaxed);
                }
                let value = counter.load(Ordering::Relaxed);
                std::hint::spin_loop();
                counter.store(value + 1, Ordering::Relaxed);
                inside.fetch_sub(1, Ordering::Relaxed);
            }
        });
        match spawned {
            Ok(id) => ids.push(id),
            Err(err) => return Err(gate.abandon(ids, err)),
        }
    }
    gate.open();
    join_all(ids);

    let total = counter.load(Ordering::SeqCst);
    if overlap.load(Ordering::SeqCst) || total != THREADS * ROUNDS {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("expected {} increments, got {total}", THREADS * ROUNDS),
        ));
    }
    Ok(vec![("threads", THREADS), ("acquires", total)])
}

/// The holder keeps the lock until the other thread has seen `try_acquire` fail.
fn try_acquire_handoff() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::TryAcquireHandoff;

    let mutex = Arc::new(Mutex::new()?);
    let held = Arc::new(Barrier::new(2));
    let checked = Arc::new(Barrier::new(2));
    let released = Arc::new(Barrier::new(2));

    let holder = {
        let (mutex, held, checked, released) = (
            Arc::clone(&mutex),
            Arc::clone(&held),
            Arc::clone(&checked),
            Arc::clone(&released),
        );
        thread::spawn(named(SCENARIO, "holder"), move || {
            mutex.acquire();
            held.wait();
            checked.wait();
            mutex.release();
            released.wait();
        })?
    };

    held.wait();
    let while_held = mutex.try_acquire();
    if while_held {
        mutex.release();
    }
    checked.wait();
    released.wait();
    let after_release = mutex.try_acquire();
    if after_release {
        mutex.release();
    }
    thread::join(holder);

    if while_held || !after_release {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("try_acquire while held = {while_held}, after release = {after_release}"),
        ));
    }
    Ok(vec![("try_acquires", 2), ("acquires", 2)])
}

struct Tokens {
    monitor: Monitor,
    available: AtomicU64,
}

/// Ten waiters each consume one token; ten notifiers each publish one.
fn monitor_wakeup() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::MonitorWakeup;
    const PAIRS: u64 = 10;

    let tokens = Arc::new(Tokens {
        monitor: Monitor::new()?,
        available: AtomicU64::new(0),
    });
    let gate = StartGate::new()?;
    let finished = Arc::new(AtomicU64::new(0));
    let waits = Arc::new(AtomicU64::new(0));
    let not_notified = Arc::new(AtomicU64::new(0));

    let mut ids = Vec::new();
    for n in 0..PAIRS {
        let (tokens_w, gate_w, finished, waits, not_notified) = (
            Arc::clone(&tokens),
            Arc::clone(&gate),
            Arc::clone(&finished),
            Arc::clone(&waits),
            Arc::clone(&not_notified),
        );
        let waiter = thread::spawn(named(SCENARIO, &format!("waiter-{n}")), move || {
            if !gate_w.pass() {
                return;
            }
            let guard = tokens_w.monitor.lock();
            let mut last = None;
            while tokens_w.available.load(Ordering::Relaxed) == 0 {
                last = Some(guard.wait(None));
                waits.fetch_add(1, Ordering::Relaxed);
            }
            // An untimed wait can only end notified (or spuriously, which
            // also reports Notified).
            if last.is_some_and(|result| result != WaitResult::Notified) {
                not_notified.fetch_add(1, Ordering::SeqCst);
            }
            tokens_w.available.fetch_sub(1, Ordering::Relaxed);
            finished.fetch_add(1, Ordering::SeqCst);
        });
        match waiter {
            Ok(id) => ids.push(id),
            Err(err) => return Err(gate.abandon(ids, err)),
        }

        let (tokens_n, gate_n) = (Arc::clone(&tokens), Arc::clone(&gate));
        let notifier = thread::spawn(named(SCENARIO, &format!("notifier-{n}")), move || {
            if !gate_n.pass() {
                return;
            }
            let guard = tokens_n.monitor.lock();
            tokens_n.available.fetch_add(1, Ordering::Relaxed);
            guard.notify_one();
        });
        match notifier {
            Ok(id) => ids.push(id),
            Err(err) => return Err(gate.abandon(ids, err)),
        }
    }
    gate.open();
    join_all(ids);

    let done = finished.load(Ordering::SeqCst);
    if done != PAIRS {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("{done} of {PAIRS} waiters finished"),
        ));
    }
    let bad = not_notified.load(Ordering::SeqCst);
    if bad != 0 {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("{bad} untimed wait(s) did not return Notified"),
        ));
    }
    Ok(vec![
        ("threads", 2 * PAIRS),
        ("notifies", PAIRS),
        ("waits", waits.load(Ordering::SeqCst)),
    ])
}

/// No one notifies; the wait must time out and come back owning the monitor.
fn timed_wait() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::TimedWait;
    const TIMEOUT: Duration = Duration::from_millis(20);

    let monitor = Monitor::new()?;
    let guard = monitor.lock();
    let started = Instant::now();
    let mut waits = 0;
    let result = loop {
        waits += 1;
        let result = guard.wait(Some(TIMEOUT));
        // A spurious wakeup before the deadline is allowed; retry.
        if result == WaitResult::TimedOut || started.elapsed() >= Duration::from_secs(5) {
            break result;
        }
    };
    let elapsed = started.elapsed();
    let owned = monitor.is_owned_by_current_thread();
    drop(guard);

    if result != WaitResult::TimedOut || !owned {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            format!("result {result:?}, lock re-held = {owned}"),
        ));
    }
    Ok(vec![
        ("waits", waits),
        ("elapsed_us", u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)),
    ])
}

/// The entry sleeps before flagging completion; join must observe the flag.
fn join_lifecycle() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::JoinLifecycle;

    let done = Arc::new(AtomicBool::new(false));
    let id = {
        let done = Arc::clone(&done);
        thread::spawn(named(SCENARIO, "worker"), move || {
            std::thread::sleep(Duration::from_millis(5));
            done.store(true, Ordering::SeqCst);
        })?
    };
    let native_id = thread::thread_id_of(&id);
    thread::join(id);

    if !done.load(Ordering::SeqCst) {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            "join returned before the entry finished",
        ));
    }
    if native_id.is_some_and(|tid| tid == thread::current_id()) {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            "worker reported the joiner's thread id",
        ));
    }
    Ok(vec![("threads", 1), ("joins", 1)])
}

/// A detached thread runs to completion with no join.
fn detach_lifecycle() -> Result<OpCounts, HarnessError> {
    const SCENARIO: Scenario = Scenario::DetachLifecycle;

    let monitor = Arc::new(Monitor::new()?);
    let done = Arc::new(AtomicBool::new(false));
    let id = {
        let (monitor, done) = (Arc::clone(&monitor), Arc::clone(&done));
        thread::spawn(named(SCENARIO, "worker"), move || {
            let guard = monitor.lock();
            done.store(true, Ordering::SeqCst);
            guard.notify_all();
        })?
    };
    thread::detach(id);

    let deadline = Instant::now() + Duration::from_secs(5);
    let guard = monitor.lock();
    while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
        guard.wait(Some(Duration::from_millis(50)));
    }
    drop(guard);

    if !done.load(Ordering::SeqCst) {
        return Err(HarnessError::failed(
            SCENARIO.name(),
            "detached thread did not finish within 5s",
        ));
    }
    Ok(vec![("threads", 1), ("detaches", 1)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_name() {
        for scenario in Scenario::ALL {
            assert_eq!(Scenario::from_name(scenario.name()), Some(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert!(Scenario::from_name("nope").is_none());
    }

    #[test]
    fn unknown_name_is_a_harness_error() {
        let err = "mutex".parse::<Scenario>().unwrap_err();
        assert!(matches!(err, HarnessError::UnknownScenario(ref s) if s == "mutex"));
    }

    fn gated_workers(
        gate: &Arc<StartGate>,
        count: usize,
        passed: &Arc<AtomicUsize>,
    ) -> Vec<ThreadJoinId> {
        (0..count)
            .map(|_| {
                let (gate, passed) = (Arc::clone(gate), Arc::clone(passed));
                thread::spawn(ThreadOptions::new(), move || {
                    if gate.pass() {
                        passed.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn failed_spawn_releases_and_joins_started_workers() {
        let gate = StartGate::new().unwrap();
        let passed = Arc::new(AtomicUsize::new(0));
        let started = gated_workers(&gate, 3, &passed);
        let refused = ThreadError::ResourceExhausted {
            resource: osthread::Resource::Thread,
            code: 11,
        };
        let err = gate.abandon(started, refused);
        assert!(matches!(err, HarnessError::Thread(ref e) if e.is_resource_exhausted()));
        // abandon joined every worker, and none got past the gate.
        assert_eq!(passed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn opened_gate_lets_every_worker_through() {
        let gate = StartGate::new().unwrap();
        let passed = Arc::new(AtomicUsize::new(0));
        let started = gated_workers(&gate, 3, &passed);
        gate.open();
        join_all(started);
        assert_eq!(passed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn timed_wait_reports_elapsed_time() {
        let counts = Scenario::TimedWait.run().unwrap();
        let elapsed = counts.iter().find(|(name, _)| *name == "elapsed_us").unwrap().1;
        assert!(elapsed >= 15_000, "{elapsed}");
    }
}
