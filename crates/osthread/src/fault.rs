//! Contract violations.
//!
//! A [`Fault`] is not an error value: it is raised with [`raise`], which never
//! returns. Using an unset key, double-joining, re-acquiring a held lock or
//! waiting without the lock would corrupt invariants the rest of the runtime
//! relies on, so they stop the faulting thread (and by default the process).

use thiserror::Error;

use crate::config::{self, FaultPolicy};
use crate::log::{self, LogEntry, LogLevel};

/// A programming error detected by the threading layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Fault {
    /// A thread-local operation was given `ThreadLocalKey::UNSET`.
    #[error("invalid argument: thread-local key is unset")]
    UnsetKey,
    /// A thread-local key was used after `delete`.
    #[error("invalid argument: thread-local key was deleted")]
    StaleKey,
    /// A thread tried to acquire a non-reentrant mutex it already holds.
    #[error("mutex acquired recursively by its owner")]
    RecursiveAcquire,
    /// A thread released a mutex it does not hold.
    #[error("mutex released by a thread that does not hold it")]
    ReleaseNotOwner,
    /// `Monitor::wait` called without holding the monitor.
    #[error("monitor wait without holding the monitor")]
    WaitWithoutLock,
    /// `Monitor::notify_*` called without holding the monitor.
    #[error("monitor notify without holding the monitor")]
    NotifyWithoutLock,
    /// A join id that was never issued, or was already joined or detached.
    #[error("join id is unknown, already joined, or detached")]
    UnknownJoinId,
    /// A thread tried to join itself.
    #[error("thread attempted to join itself")]
    JoinSelf,
    /// A native primitive failed in a way its contract rules out.
    #[error("{op} failed unexpectedly (os error {code})")]
    Native { op: &'static str, code: i32 },
}

impl Fault {
    /// Stable short name used as the `fault` field of the log entry.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UnsetKey => "unset_key",
            Self::StaleKey => "stale_key",
            Self::RecursiveAcquire => "recursive_acquire",
            Self::ReleaseNotOwner => "release_not_owner",
            Self::WaitWithoutLock => "wait_without_lock",
            Self::NotifyWithoutLock => "notify_without_lock",
            Self::UnknownJoinId => "unknown_join_id",
            Self::JoinSelf => "join_self",
            Self::Native { .. } => "native",
        }
    }

    /// True for the faults that reject an argument outright.
    #[must_use]
    pub const fn is_invalid_argument(self) -> bool {
        matches!(self, Self::UnsetKey | Self::StaleKey | Self::UnknownJoinId)
    }
}

/// Report `fault` and stop. Never returns.
///
/// Logs a `fatal` structured entry, then aborts the process or panics
/// depending on [`config::fault_policy`].
#[cold]
#[inline(never)]
#[track_caller]
pub fn raise(fault: Fault) -> ! {
    let location = std::panic::Location::caller();
    let mut entry = LogEntry::new(LogLevel::Fatal, "fault")
        .with_fault(fault.name())
        .with_details(serde_json::json!({
            "message": fault.to_string(),
            "location": format!("{}:{}", location.file(), location.line()),
        }));
    if let Fault::Native { code, .. } = fault {
        entry = entry.with_errno(code);
    }
    log::emit(&entry);

    match config::fault_policy() {
        FaultPolicy::Panic => panic!("osthread fault: {fault}"),
        FaultPolicy::Abort => {
            eprintln!("osthread fault: {fault} at {location}");
            std::process::abort()
        }
    }
}

/// Raise [`Fault::Native`] unless `rc` is zero.
#[inline]
#[track_caller]
pub(crate) fn check_native(op: &'static str, rc: i32) {
    if rc != 0 {
        raise(Fault::Native { op, code: rc });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_snake_case() {
        for fault in [
            Fault::UnsetKey,
            Fault::StaleKey,
            Fault::RecursiveAcquire,
            Fault::ReleaseNotOwner,
            Fault::WaitWithoutLock,
            Fault::NotifyWithoutLock,
            Fault::UnknownJoinId,
            Fault::JoinSelf,
            Fault::Native { op: "x", code: 1 },
        ] {
            let name = fault.name();
            assert!(!name.is_empty());
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn invalid_argument_classification() {
        assert!(Fault::UnsetKey.is_invalid_argument());
        assert!(Fault::UnknownJoinId.is_invalid_argument());
        assert!(!Fault::RecursiveAcquire.is_invalid_argument());
        assert!(!Fault::Native { op: "pthread_join", code: 3 }.is_invalid_argument());
    }

    #[test]
    fn native_fault_message_carries_code() {
        let fault = Fault::Native {
            op: "pthread_mutex_lock",
            code: 22,
        };
        assert_eq!(
            fault.to_string(),
            "pthread_mutex_lock failed unexpectedly (os error 22)"
        );
    }

    #[test]
    #[should_panic(expected = "osthread fault: monitor wait without holding the monitor")]
    fn raise_panics_under_panic_policy() {
        config::set_fault_policy(FaultPolicy::Panic);
        raise(Fault::WaitWithoutLock);
    }

    #[test]
    fn check_native_accepts_zero() {
        check_native("pthread_cond_signal", 0);
    }
}
