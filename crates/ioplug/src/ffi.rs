// SPDX-License-Identifier: Apache-2.0
//! Raw ABI types for the provider plugin interface.
//!
//! A plugin object is a pointer whose first word points at a table of
//! function pointers. The first three slots of every table are fixed:
//!
//! ```text
//! slot 0  query_capability(this, capability, out) -> status
//! slot 1  add_ref(this) -> count
//! slot 2  release(this) -> count
//! slot 3… interface-specific, appended per version
//! ```
//!
//! Later versions of an interface only append slots. An older caller can
//! therefore call through a newer provider's table using its own, shorter
//! view of the layout.

use std::ffi::{c_char, c_void};
use std::os::raw::c_int;

// ===========================================================================
// Opaque handle types
// ===========================================================================

/// Pointer to a provider object. The first word of the object points at its
/// function table.
pub type RawObject = *mut c_void;

/// Native object identity for services and iterators (`0` is "none").
pub type RawService = u32;

/// Capability identity as it crosses the ABI: 16 bytes, passed by value.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCapabilityId {
    pub bytes: [u8; 16],
}

// ===========================================================================
// Status codes
// ===========================================================================

pub const STATUS_SUCCESS: c_int = 0;
pub const STATUS_ERROR: c_int = 0xE000_02BC_u32 as c_int;
pub const STATUS_NO_DEVICE: c_int = 0xE000_02C0_u32 as c_int;
pub const STATUS_BAD_ARGUMENT: c_int = 0xE000_02C2_u32 as c_int;
pub const STATUS_UNSUPPORTED: c_int = 0xE000_02C7_u32 as c_int;
pub const STATUS_TIMEOUT: c_int = 0xE000_02D6_u32 as c_int;
pub const STATUS_ABORTED: c_int = 0xE000_02EB_u32 as c_int;

/// Returned by `query_capability` when the object does not implement the
/// requested capability.
pub const STATUS_NO_INTERFACE: c_int = 0x8000_0004_u32 as c_int;

/// Returns `true` if the provider status indicates success.
#[inline]
pub fn is_success(code: c_int) -> bool {
    code == STATUS_SUCCESS
}

// ===========================================================================
// Function table header (slots 0-2)
// ===========================================================================

/// Number of slots every function table starts with.
pub const HEADER_SLOTS: usize = 3;

/// `int query_capability(this, capability, out)`
pub type FnQueryCapability =
    unsafe extern "C" fn(this: RawObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int;

/// `uint32_t add_ref(this)`
pub type FnAddRef = unsafe extern "C" fn(this: RawObject) -> u32;

/// `uint32_t release(this)`
pub type FnRelease = unsafe extern "C" fn(this: RawObject) -> u32;

/// The fixed prefix of every function table.
#[repr(C)]
pub struct TableHeader {
    pub query_capability: FnQueryCapability,
    pub add_ref: FnAddRef,
    pub release: FnRelease,
}

/// Read the function table pointer out of a provider object.
///
/// # Safety
///
/// `object` must be a live, non-null provider object.
#[inline]
pub unsafe fn table_of(object: RawObject) -> *const TableHeader {
    unsafe { *(object as *const *const TableHeader) }
}

/// Read the raw function pointer stored at `index` in `object`'s table.
///
/// # Safety
///
/// `object` must be live and its table must have more than `index` slots.
#[inline]
pub unsafe fn slot_of(object: RawObject, index: usize) -> *const c_void {
    unsafe {
        let table = table_of(object) as *const *const c_void;
        *table.add(index)
    }
}

// ===========================================================================
// Completion callbacks
// ===========================================================================

/// `void callback(context, status, args, num_args)`
///
/// Invoked by the provider on a thread of its choosing once an asynchronous
/// operation finishes. `args` points at `num_args` machine words.
pub type CompletionCallback =
    unsafe extern "C" fn(context: *mut c_void, status: c_int, args: *const usize, num_args: u32);

// ===========================================================================
// Provider entry points
//
// Every provider library exports these with a library-specific prefix. The
// "MOCK" provider exports:
//   MOCK_create_plugin_interface
//   MOCK_destroy_plugin_interface
//   MOCK_iterator_next
//   MOCK_iterator_is_valid
//   MOCK_object_release
//   MOCK_provider_version   (optional)
// ===========================================================================

/// `int create_plugin_interface(service, factory_type, out, score)`
pub type FnCreatePluginInterface = unsafe extern "C" fn(
    service: RawService,
    factory_type: RawCapabilityId,
    out: *mut RawObject,
    score: *mut i32,
) -> c_int;

/// `int destroy_plugin_interface(object)`
pub type FnDestroyPluginInterface = unsafe extern "C" fn(object: RawObject) -> c_int;

/// `uint32_t iterator_next(iterator)`; `0` when exhausted.
pub type FnIteratorNext = unsafe extern "C" fn(iterator: RawService) -> RawService;

/// `uint8_t iterator_is_valid(iterator)`; non-zero while valid.
pub type FnIteratorIsValid = unsafe extern "C" fn(iterator: RawService) -> u8;

/// `int object_release(object)`
pub type FnObjectRelease = unsafe extern "C" fn(object: RawService) -> c_int;

/// `const char *provider_version(void)`; a static NUL-terminated string.
pub type FnProviderVersion = unsafe extern "C" fn() -> *const c_char;
