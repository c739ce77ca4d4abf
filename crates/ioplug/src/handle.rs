// SPDX-License-Identifier: Apache-2.0
//! Ownership wrapper for native object pointers.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{NegotiationError, Result};
use crate::ffi::RawObject;

/// Holds a native object pointer until it is taken for release.
///
/// Once [`HandleGuard::take`] has run, every [`HandleGuard::get`] reports
/// [`NegotiationError::DisposedHandle`] instead of handing out a stale
/// pointer. `take` succeeds for exactly one caller.
pub struct HandleGuard {
    raw: AtomicPtr<c_void>,
}

impl HandleGuard {
    /// Wrap a live object. Returns `None` for a null pointer.
    pub fn new(raw: RawObject) -> Option<Self> {
        if raw.is_null() {
            None
        } else {
            Some(Self {
                raw: AtomicPtr::new(raw),
            })
        }
    }

    /// The object pointer, or `DisposedHandle` once taken.
    pub fn get(&self) -> Result<RawObject> {
        let raw = self.raw.load(Ordering::Acquire);
        if raw.is_null() {
            Err(NegotiationError::DisposedHandle)
        } else {
            Ok(raw)
        }
    }

    /// Null the guard and return the pointer it held. Only the first call
    /// gets `Some`.
    pub fn take(&self) -> Option<RawObject> {
        let raw = self.raw.swap(std::ptr::null_mut(), Ordering::AcqRel);
        (!raw.is_null()).then_some(raw)
    }

    pub fn is_live(&self) -> bool {
        !self.raw.load(Ordering::Acquire).is_null()
    }
}

impl fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleGuard")
            .field(&self.raw.load(Ordering::Relaxed))
            .finish()
    }
}
