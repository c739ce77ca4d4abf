// SPDX-License-Identifier: Apache-2.0
//! Reference-counted bindings to provider objects.
//!
//! A [`Binding`] owns the references the managed side holds on one provider
//! object: the reference it was created with plus one per [`Binding::add_ref`].
//! Releasing the last of them, or disposing the binding, runs the teardown
//! call exactly once and nulls the handle; every later call through the
//! binding reports [`NegotiationError::DisposedHandle`].
//!
//! ```text
//!            add_ref / release (more than one held)
//!                 ┌──────┐
//!                 ▼      │
//!   create ──▶  Bound ───┘
//!                 │
//!      ┌──────────┴───────────┐
//!  release (last held)     dispose / drop
//!      ▼                      ▼
//!   Released               Disposed
//! ```
//!
//! There is no `Unbound` value: a binding only exists once the provider has
//! handed over a live object.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::capability::CapabilityId;
use crate::descriptor::InterfaceDescriptor;
use crate::error::{NegotiationError, Result};
use crate::ffi::RawObject;
use crate::handle::HandleGuard;
use crate::provider::PluginProvider;
use crate::table::InterfaceTable;

/// Lifecycle state of a [`Binding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// The handle is live.
    Bound,
    /// The last held reference was released.
    Released,
    /// The owner tore the binding down explicitly.
    Disposed,
}

const BOUND: u8 = 0;
const RELEASED: u8 = 1;
const DISPOSED: u8 = 2;

/// How the binding's final reference goes back to the provider.
pub(crate) enum Teardown {
    /// Through slot 2 of the object's own table.
    Release,
    /// Through the provider's destroy entry point (factory objects).
    Destroy(Arc<dyn PluginProvider>),
    /// The first reference was borrowed; nothing to return for it.
    Borrowed,
}

/// A live, versioned reference to a provider object.
///
/// `Binding` is `Send` but not `Sync`: one logical owner uses it at a time.
/// Release and dispose take `&mut self`, so no [`InterfaceTable`] borrowed
/// from the binding can outlive the handle.
pub struct Binding {
    guard: HandleGuard,
    descriptor: &'static InterfaceDescriptor,
    held: Cell<u32>,
    state: AtomicU8,
    teardown: Teardown,
}

impl Binding {
    pub(crate) fn adopt(
        raw: RawObject,
        descriptor: &'static InterfaceDescriptor,
        teardown: Teardown,
    ) -> Result<Self> {
        let guard = HandleGuard::new(raw).ok_or(NegotiationError::DisposedHandle)?;
        tracing::debug!("bound {} at {raw:?}", descriptor.name());
        Ok(Self {
            guard,
            descriptor,
            held: Cell::new(1),
            state: AtomicU8::new(BOUND),
            teardown,
        })
    }

    /// Wrap an object the provider lent us without transferring a reference.
    ///
    /// Teardown returns only references taken with [`Binding::add_ref`].
    ///
    /// # Safety
    ///
    /// `raw` must be a live object implementing every slot of `descriptor`,
    /// and must stay live until the binding is released or disposed.
    pub unsafe fn wrap_unowned(raw: RawObject, descriptor: &'static InterfaceDescriptor) -> Result<Self> {
        descriptor.check_layout()?;
        Self::adopt(raw, descriptor, Teardown::Borrowed)
    }

    pub fn state(&self) -> BindingState {
        match self.state.load(Ordering::Acquire) {
            BOUND => BindingState::Bound,
            RELEASED => BindingState::Released,
            _ => BindingState::Disposed,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state() == BindingState::Bound
    }

    /// The descriptor this binding was negotiated for.
    pub fn descriptor(&self) -> &'static InterfaceDescriptor {
        self.descriptor
    }

    pub fn capability_id(&self) -> CapabilityId {
        self.descriptor.capability_id()
    }

    /// Whether the binding's first reference is its own to return.
    pub fn owns_handle(&self) -> bool {
        !matches!(self.teardown, Teardown::Borrowed)
    }

    /// References this binding currently holds (zero once terminal).
    pub fn held_references(&self) -> u32 {
        if self.is_bound() { self.held.get() } else { 0 }
    }

    /// Borrow the function table for a call. Fails with `DisposedHandle`
    /// once the binding is released or disposed.
    pub fn table(&self) -> Result<InterfaceTable<'_>> {
        let raw = self.guard.get()?;
        // SAFETY: the guard is live, and `&self` keeps release/dispose out
        // for the table's lifetime.
        Ok(unsafe { InterfaceTable::new(raw, self.descriptor) })
    }

    /// Take one more reference. Returns the provider's new count.
    pub fn add_ref(&self) -> Result<u32> {
        let count = self.table()?.add_ref();
        self.held.set(self.held.get() + 1);
        Ok(count)
    }

    /// Return one reference. Returns the provider's new count.
    ///
    /// Returning the last held reference moves the binding to
    /// [`BindingState::Released`]. On a released or disposed binding this is
    /// a no-op returning `Ok(0)`.
    pub fn release(&mut self) -> Result<u32> {
        if !self.is_bound() {
            tracing::trace!("release on terminal {} ignored", self.descriptor.name());
            return Ok(0);
        }

        let held = self.held.get();
        if held > 1 {
            let count = self.table()?.release();
            self.held.set(held - 1);
            return Ok(count);
        }

        if self.state.compare_exchange(BOUND, RELEASED, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(0);
        }
        let count = self.finish(0);
        tracing::debug!("released {} (provider count {count})", self.descriptor.name());
        Ok(count)
    }

    /// Tear the binding down: return every held reference, run teardown and
    /// null the handle. Idempotent.
    pub fn dispose(&mut self) {
        if self.state.compare_exchange(BOUND, DISPOSED, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        let extra = self.held.get().saturating_sub(1);
        self.finish(extra);
        tracing::debug!("disposed {}", self.descriptor.name());
    }

    /// Return `extra` references through slot 2, then the first one through
    /// the teardown path. Runs at most once per binding.
    fn finish(&mut self, extra: u32) -> u32 {
        let Some(raw) = self.guard.take() else {
            return 0;
        };
        self.held.set(0);

        // SAFETY: `raw` was live until the guard was taken just now.
        let table = unsafe { InterfaceTable::new(raw, self.descriptor) };
        let mut count = 0;
        for _ in 0..extra {
            count = table.release();
        }

        match &self.teardown {
            Teardown::Release => table.release(),
            Teardown::Destroy(provider) => {
                if let Err(e) = provider.destroy_plugin_interface(raw) {
                    tracing::error!(
                        "provider '{}' failed to destroy {}: {e}",
                        provider.name(),
                        self.descriptor.name()
                    );
                }
                0
            }
            Teardown::Borrowed => count,
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("interface", &self.descriptor.name())
            .field("capability", &self.descriptor.capability_id())
            .field("state", &self.state())
            .field("held", &self.held_references())
            .field("owns_handle", &self.owns_handle())
            .finish()
    }
}
