// SPDX-License-Identifier: Apache-2.0
//! Forward-only service enumeration.
//!
//! The provider owns the iterator and decides when it becomes stale (for
//! example when the registry changes underneath it). A stale iterator is
//! reported as [`NegotiationError::StaleEnumeration`], never as the end of
//! the sequence, so callers can tell "exhausted" from "invalidated". Nothing
//! here retries.

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::error::{NegotiationError, Result};
use crate::ffi;
use crate::provider::{PluginProvider, ServiceId};

/// An owned reference to a service object, released on drop.
pub struct ServiceHandle {
    provider: Arc<dyn PluginProvider>,
    id: ServiceId,
}

impl ServiceHandle {
    /// Take ownership of one reference to `id`.
    pub fn new(provider: Arc<dyn PluginProvider>, id: ServiceId) -> Self {
        Self { provider, id }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Give up ownership without releasing the reference.
    pub fn into_raw(self) -> ServiceId {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the provider is read out once.
        drop(unsafe { std::ptr::read(&this.provider) });
        this.id
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.provider.release_object(self.id) {
            tracing::error!("failed to release service {}: {e}", self.id);
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceHandle").field(&self.id).finish()
    }
}

/// Pull-based cursor over a provider iterator.
pub struct ServiceCursor {
    provider: Arc<dyn PluginProvider>,
    iterator: ServiceId,
    exhausted: bool,
    failed: bool,
}

impl ServiceCursor {
    /// Take ownership of the provider iterator `iterator`.
    pub fn new(provider: Arc<dyn PluginProvider>, iterator: ServiceId) -> Result<Self> {
        if iterator.is_none() {
            return Err(NegotiationError::NativeError(ffi::STATUS_BAD_ARGUMENT));
        }
        Ok(Self {
            provider,
            iterator,
            exhausted: false,
            failed: false,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.provider.iterator_is_valid(self.iterator)
    }

    /// The next service, `Ok(None)` once exhausted, or `StaleEnumeration` if
    /// the provider invalidated the iterator.
    pub fn next_service(&mut self) -> Result<Option<ServiceHandle>> {
        if self.exhausted {
            return Ok(None);
        }
        if !self.is_valid() {
            return Err(self.stale());
        }
        match self.provider.iterator_next(self.iterator) {
            Some(id) => Ok(Some(ServiceHandle::new(Arc::clone(&self.provider), id))),
            None => {
                // The end of a sequence that went stale mid-walk is not an end.
                if !self.is_valid() {
                    return Err(self.stale());
                }
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn stale(&mut self) -> NegotiationError {
        tracing::debug!("iterator {} on '{}' is stale", self.iterator, self.provider.name());
        self.failed = true;
        NegotiationError::StaleEnumeration
    }
}

impl Iterator for ServiceCursor {
    type Item = Result<ServiceHandle>;

    /// Yields the staleness error once, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.next_service().transpose()
    }
}

impl Drop for ServiceCursor {
    fn drop(&mut self) {
        if let Err(e) = self.provider.release_object(self.iterator) {
            tracing::error!("failed to release iterator {}: {e}", self.iterator);
        }
    }
}

impl fmt::Debug for ServiceCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCursor")
            .field("iterator", &self.iterator)
            .field("exhausted", &self.exhausted)
            .field("failed", &self.failed)
            .finish()
    }
}
