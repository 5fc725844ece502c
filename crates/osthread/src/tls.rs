//! Thread-local storage slots.
//!
//! A [`ThreadLocalKey`] names one process-wide slot; every thread sees its own
//! machine-word value for it, 0 until that thread writes one. The runtime uses a
//! key to find the execution context attached to the calling thread, so `get`
//! is kept free of locks, allocation and logging.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::error::Result;
use crate::fault::{self, Fault};
use crate::log::{self, LogLevel};
use crate::platform::{Backend, Native, NativeKey};

/// Destructor run on thread exit for every thread whose value is non-zero.
pub type ThreadLocalDestructor = unsafe extern "C" fn(*mut c_void);

/// Opaque identifier of one thread-local slot.
///
/// Either [`ThreadLocalKey::UNSET`] or a key returned by `allocate` that has
/// not been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLocalKey(NativeKey);

impl Default for ThreadLocalKey {
    fn default() -> Self {
        Self::UNSET
    }
}

impl ThreadLocalKey {
    /// The reserved "no slot allocated" key.
    pub const UNSET: Self = Self(<Native as Backend>::UNSET_KEY);

    /// Reserve a new slot.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` (resource `TlsSlot`) when no slot is free.
    pub fn allocate() -> Result<Self> {
        Self::create(None)
    }

    /// Reserve a new slot whose non-zero values are passed to `destructor`
    /// when their thread exits.
    ///
    /// # Errors
    ///
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_with_destructor(destructor: ThreadLocalDestructor) -> Result<Self> {
        Self::create(Some(destructor))
    }

    fn create(destructor: Option<ThreadLocalDestructor>) -> Result<Self> {
        match Native::key_create(destructor) {
            Ok(key) => {
                log::event(LogLevel::Debug, "tls_key_allocated", |e| {
                    e.with_details(serde_json::json!({
                        "key": format!("{key:?}"),
                        "destructor": destructor.is_some(),
                    }))
                });
                Ok(Self(key))
            }
            Err(err) => {
                log::event(LogLevel::Warn, "tls_key_exhausted", |e| {
                    e.with_errno(err.code())
                        .with_details(serde_json::json!({ "error": err.to_string() }))
                });
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }

    #[inline]
    #[track_caller]
    fn checked(self) -> NativeKey {
        if self.is_unset() {
            fault::raise(Fault::UnsetKey);
        }
        self.0
    }

    /// The calling thread's value, 0 if it never set one.
    #[inline]
    #[must_use]
    #[track_caller]
    pub fn get(self) -> usize {
        Native::key_get(self.checked())
    }

    /// Store `value` for the calling thread only.
    #[inline]
    #[track_caller]
    pub fn set(self, value: usize) {
        Native::key_set(self.checked(), value);
    }

    /// Set `value` for the calling thread until the returned guard drops,
    /// which stores 0 again.
    #[track_caller]
    pub fn attach(self, value: usize) -> AttachGuard {
        self.set(value);
        AttachGuard {
            key: self,
            _not_send: PhantomData,
        }
    }

    /// Release the slot. The key must not be used afterwards.
    #[track_caller]
    pub fn delete(self) {
        Native::key_delete(self.checked());
        log::event(LogLevel::Debug, "tls_key_deleted", |e| {
            e.with_details(serde_json::json!({ "key": format!("{:?}", self.0) }))
        });
    }
}

/// Clears a key's value for the thread that attached it.
#[must_use = "dropping the guard detaches immediately"]
pub struct AttachGuard {
    key: ThreadLocalKey,
    _not_send: PhantomData<*const ()>,
}

impl AttachGuard {
    #[must_use]
    pub fn key(&self) -> ThreadLocalKey {
        self.key
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.key.set(0);
    }
}
