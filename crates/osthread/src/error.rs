//! Recoverable errors.
//!
//! Only resource acquisition can fail recoverably: the OS may refuse a new
//! thread, a thread-local slot, or a synchronization object. Everything else
//! that goes wrong at this layer is a contract violation and is reported via
//! [`crate::fault`] instead.

use std::fmt;

use thiserror::Error;

#[cfg(unix)]
pub(crate) const EAGAIN: i32 = libc::EAGAIN;
#[cfg(unix)]
pub(crate) const ENOMEM: i32 = libc::ENOMEM;

#[cfg(not(unix))]
pub(crate) const EAGAIN: i32 = 11;
#[cfg(not(unix))]
pub(crate) const ENOMEM: i32 = 12;

/// Kind of native resource a creation call asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A native thread (handle, stack, kernel task).
    Thread,
    /// A thread-local storage key.
    TlsSlot,
    /// A native mutex or condition variable.
    SyncObject,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Thread => "thread",
            Self::TlsSlot => "thread-local slot",
            Self::SyncObject => "synchronization object",
        })
    }
}

/// Error returned by the creation operations of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The OS refused to grant the resource (EAGAIN / ENOMEM or a full table).
    #[error("resource exhausted: cannot allocate {resource} (os error {code})")]
    ResourceExhausted { resource: Resource, code: i32 },
    /// A native creation call failed for a reason other than exhaustion.
    #[error("{op} failed (os error {code})")]
    Os { op: &'static str, code: i32 },
}

impl ThreadError {
    /// Classify an errno-style return code from a native creation call.
    #[must_use]
    pub fn from_errno(op: &'static str, resource: Resource, code: i32) -> Self {
        if code == EAGAIN || code == ENOMEM {
            Self::ResourceExhausted { resource, code }
        } else {
            Self::Os { op, code }
        }
    }

    /// The table-full case for backends that manage their own slot tables.
    #[must_use]
    pub const fn exhausted(resource: Resource) -> Self {
        Self::ResourceExhausted {
            resource,
            code: EAGAIN,
        }
    }

    #[must_use]
    pub const fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// The raw errno-style code carried by the error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::ResourceExhausted { code, .. } | Self::Os { code, .. } => *code,
        }
    }
}

pub type Result<T> = std::result::Result<T, ThreadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eagain_and_enomem_are_exhaustion() {
        let err = ThreadError::from_errno("pthread_create", Resource::Thread, EAGAIN);
        assert!(err.is_resource_exhausted());
        assert_eq!(err.code(), EAGAIN);

        let err = ThreadError::from_errno("pthread_key_create", Resource::TlsSlot, ENOMEM);
        assert_eq!(
            err,
            ThreadError::ResourceExhausted {
                resource: Resource::TlsSlot,
                code: ENOMEM
            }
        );
    }

    #[test]
    fn other_codes_are_os_errors() {
        let err = ThreadError::from_errno("pthread_mutex_init", Resource::SyncObject, 22);
        assert!(!err.is_resource_exhausted());
        assert_eq!(err.to_string(), "pthread_mutex_init failed (os error 22)");
    }

    #[test]
    fn exhausted_display_names_resource() {
        let err = ThreadError::exhausted(Resource::TlsSlot);
        assert!(err.to_string().contains("thread-local slot"));
    }
}
