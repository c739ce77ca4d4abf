// SPDX-License-Identifier: Apache-2.0
//! Bound function tables.
//!
//! An [`InterfaceTable`] is a short-lived view of a live binding's function
//! table, read through the layout of the descriptor the binding was
//! negotiated for. It borrows the binding, so the binding cannot be released
//! or disposed while a table is in use.

use std::ffi::c_void;
use std::marker::PhantomData;

use crate::capability::CapabilityId;
use crate::descriptor::InterfaceDescriptor;
use crate::error::{NegotiationError, Result};
use crate::ffi::{self, RawObject};

/// Versioned view of a bound object's function table.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceTable<'b> {
    object: RawObject,
    descriptor: &'static InterfaceDescriptor,
    _binding: PhantomData<&'b ()>,
}

impl<'b> InterfaceTable<'b> {
    /// # Safety
    ///
    /// `object` must be live for `'b` and implement at least the slots
    /// `descriptor` lists.
    pub(crate) unsafe fn new(object: RawObject, descriptor: &'static InterfaceDescriptor) -> Self {
        Self {
            object,
            descriptor,
            _binding: PhantomData,
        }
    }

    /// The object pointer to pass as `this` to slot functions.
    pub fn object(&self) -> RawObject {
        self.object
    }

    pub fn descriptor(&self) -> &'static InterfaceDescriptor {
        self.descriptor
    }

    /// Position of the named slot in the bound layout.
    pub fn slot_index(&self, name: &str) -> Result<usize> {
        self.descriptor.slot_index(name).ok_or_else(|| {
            NegotiationError::InvalidDescriptor(format!(
                "{} has no slot named '{name}'",
                self.descriptor.name()
            ))
        })
    }

    /// The raw function pointer at `index`.
    ///
    /// Indexes beyond the bound layout fail with
    /// [`NegotiationError::SlotOutOfRange`], even if the provider's table is
    /// longer. A null slot reports `NativeError(STATUS_UNSUPPORTED)`.
    pub fn raw_slot(&self, index: usize) -> Result<*const c_void> {
        if index >= self.descriptor.slot_count() {
            return Err(NegotiationError::SlotOutOfRange {
                index,
                slot_count: self.descriptor.slot_count(),
                capability: self.descriptor.capability_id(),
            });
        }
        // SAFETY: the object is live for 'b and the layout covers `index`.
        let slot = unsafe { ffi::slot_of(self.object, index) };
        if slot.is_null() {
            return Err(NegotiationError::NativeError(ffi::STATUS_UNSUPPORTED));
        }
        Ok(slot)
    }

    /// The slot at `index` as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be the `extern "C"` function pointer type the provider stores
    /// at `index`.
    pub unsafe fn slot<F: Copy>(&self, index: usize) -> Result<F> {
        const {
            assert!(
                std::mem::size_of::<F>() == std::mem::size_of::<*const c_void>(),
                "slot type must be a thin function pointer"
            );
        }
        let raw = self.raw_slot(index)?;
        // SAFETY: sizes match and the caller vouches for the signature.
        Ok(unsafe { std::mem::transmute_copy::<*const c_void, F>(&raw) })
    }

    /// The named slot as a typed function pointer.
    ///
    /// # Safety
    ///
    /// As for [`InterfaceTable::slot`].
    pub unsafe fn slot_named<F: Copy>(&self, name: &str) -> Result<F> {
        let index = self.slot_index(name)?;
        unsafe { self.slot(index) }
    }

    fn header(&self) -> &ffi::TableHeader {
        // SAFETY: every validated layout starts with the three header slots.
        unsafe { &*ffi::table_of(self.object) }
    }

    /// Ask the object for another capability. On success the provider has
    /// taken a new reference on behalf of the returned object.
    pub(crate) fn query(&self, capability: CapabilityId) -> Result<RawObject> {
        let mut out: RawObject = std::ptr::null_mut();
        let status = unsafe { (self.header().query_capability)(self.object, capability.to_raw(), &mut out) };
        if !ffi::is_success(status) {
            return Err(NegotiationError::NativeError(status));
        }
        if out.is_null() {
            tracing::warn!("protocol violation: query for {capability} succeeded but returned a null object");
            return Err(NegotiationError::NativeError(ffi::STATUS_NO_INTERFACE));
        }
        Ok(out)
    }

    pub(crate) fn add_ref(&self) -> u32 {
        unsafe { (self.header().add_ref)(self.object) }
    }

    pub(crate) fn release(&self) -> u32 {
        unsafe { (self.header().release)(self.object) }
    }
}
