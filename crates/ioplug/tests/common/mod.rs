// SPDX-License-Identifier: Apache-2.0
//! In-process mock provider shared by the integration tests.
//!
//! Every object here is laid out the way a native provider lays it out: the
//! first word points at a `#[repr(C)]` table of `extern "C"` functions, and
//! the crate only ever talks to it through those tables and the
//! [`PluginProvider`] seam.
//!
//! Services:
//! - `1`, `2`: well-behaved devices;
//! - `3`: a faulty device that fires every completion twice.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ioplug::ffi::{self, CompletionCallback, RawCapabilityId, RawObject, TableHeader};
use ioplug::{CapabilityId, InterfaceDescriptor, NegotiationError, PluginProvider, ProviderVersion, Result, ServiceId};

/// Route crate logs to the test harness; filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

pub static FACTORY: InterfaceDescriptor = InterfaceDescriptor::new(
    "DeviceFactory",
    CapabilityId::from_u128(0x10F0),
    ProviderVersion::new(1, 0, 0),
    &ioplug::descriptor::HEADER_LAYOUT,
);

pub static DEVICE_V1: InterfaceDescriptor = InterfaceDescriptor::new(
    "Device",
    CapabilityId::from_u128(0x10A1),
    ProviderVersion::new(1, 0, 0),
    &["query_capability", "add_ref", "release", "read_register"],
);

pub static DEVICE_V1_8: InterfaceDescriptor = InterfaceDescriptor::new(
    "Device180",
    CapabilityId::from_u128(0x10A2),
    ProviderVersion::new(1, 8, 0),
    &["query_capability", "add_ref", "release", "read_register", "submit_read"],
)
.extends(&DEVICE_V1);

pub static DEVICE_V2: InterfaceDescriptor = InterfaceDescriptor::new(
    "Device200",
    CapabilityId::from_u128(0x10A3),
    ProviderVersion::new(2, 0, 0),
    &["query_capability", "add_ref", "release", "read_register", "submit_read", "reset"],
)
.extends(&DEVICE_V1_8);

pub static DIAGNOSTICS: InterfaceDescriptor = InterfaceDescriptor::new(
    "Diagnostics",
    CapabilityId::from_u128(0x10D1),
    ProviderVersion::new(1, 0, 0),
    &["query_capability", "add_ref", "release", "self_test"],
);

pub type FnReadRegister = unsafe extern "C" fn(this: RawObject, register: u32, value: *mut u32) -> c_int;
pub type FnSubmitRead = unsafe extern "C" fn(
    this: RawObject,
    buffer: *mut u8,
    len: usize,
    timeout_ms: u32,
    callback: CompletionCallback,
    context: *mut c_void,
) -> c_int;
pub type FnReset = unsafe extern "C" fn(this: RawObject) -> c_int;
pub type FnSelfTest = unsafe extern "C" fn(this: RawObject) -> c_int;

/// The value `read_register` reports for `register` on `service`.
pub fn register_value(service: u32, register: u32) -> u32 {
    (service << 16) | register
}

/// The byte `submit_read` fills buffers with on `service`.
pub fn fill_byte(service: u32) -> u8 {
    0xB0 | service as u8
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[repr(C)]
struct DeviceTable {
    header: TableHeader,
    read_register: FnReadRegister,
    submit_read: FnSubmitRead,
    reset: FnReset,
}

#[repr(C)]
struct DiagnosticsTable {
    header: TableHeader,
    self_test: FnSelfTest,
}

static DEVICE_TABLE: DeviceTable = DeviceTable {
    header: TableHeader {
        query_capability: device_query,
        add_ref: device_add_ref,
        release: device_release,
    },
    read_register: device_read_register,
    submit_read: device_submit_read,
    reset: device_reset,
};

static DIAGNOSTICS_TABLE: DiagnosticsTable = DiagnosticsTable {
    header: TableHeader {
        query_capability: facet_query,
        add_ref: facet_add_ref,
        release: facet_release,
    },
    self_test: facet_self_test,
};

static FACTORY_TABLE: TableHeader = TableHeader {
    query_capability: factory_query,
    add_ref: factory_add_ref,
    release: factory_release,
};

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// A diagnostics tear-off sharing its device's reference count.
#[repr(C)]
struct DiagnosticsFacet {
    table: *const DiagnosticsTable,
    device: *const DeviceObject,
}

#[repr(C)]
pub struct DeviceObject {
    table: *const DeviceTable,
    count: AtomicU32,
    service: u32,
    duplicate_completions: bool,
    resets: AtomicU32,
    facet: DiagnosticsFacet,
}

impl DeviceObject {
    fn boxed(service: u32, duplicate_completions: bool) -> Box<Self> {
        let mut device = Box::new(Self {
            table: &DEVICE_TABLE,
            count: AtomicU32::new(0),
            service,
            duplicate_completions,
            resets: AtomicU32::new(0),
            facet: DiagnosticsFacet {
                table: &DIAGNOSTICS_TABLE,
                device: std::ptr::null(),
            },
        });
        let this: *const DeviceObject = &*device;
        device.facet.device = this;
        device
    }

    fn as_raw(&self) -> RawObject {
        (self as *const Self).cast_mut().cast()
    }

    fn facet_raw(&self) -> RawObject {
        (&self.facet as *const DiagnosticsFacet).cast_mut().cast()
    }

    /// References callers currently hold on this device (all facets).
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

#[repr(C)]
struct FactoryObject {
    table: *const TableHeader,
    count: AtomicU32,
    device: *const DeviceObject,
}

unsafe fn device<'a>(this: RawObject) -> &'a DeviceObject {
    unsafe { &*(this as *const DeviceObject) }
}

unsafe fn facet<'a>(this: RawObject) -> &'a DiagnosticsFacet {
    unsafe { &*(this as *const DiagnosticsFacet) }
}

unsafe fn factory<'a>(this: RawObject) -> &'a FactoryObject {
    unsafe { &*(this as *const FactoryObject) }
}

fn is_device_capability(capability: CapabilityId) -> bool {
    [&DEVICE_V1, &DEVICE_V1_8, &DEVICE_V2]
        .iter()
        .any(|d| d.capability_id() == capability)
}

/// Hand out `object` for `capability` on `device`, taking a reference.
unsafe fn answer(device: &DeviceObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int {
    let capability = CapabilityId::from_raw(capability);
    let object = if is_device_capability(capability) {
        device.as_raw()
    } else if capability == DIAGNOSTICS.capability_id() {
        device.facet_raw()
    } else {
        return ffi::STATUS_NO_INTERFACE;
    };
    device.count.fetch_add(1, Ordering::SeqCst);
    unsafe { *out = object };
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn device_query(this: RawObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int {
    unsafe { answer(device(this), capability, out) }
}

unsafe extern "C" fn device_add_ref(this: RawObject) -> u32 {
    unsafe { device(this) }.count.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "C" fn device_release(this: RawObject) -> u32 {
    unsafe { device(this) }.count.fetch_sub(1, Ordering::SeqCst) - 1
}

unsafe extern "C" fn device_read_register(this: RawObject, register: u32, value: *mut u32) -> c_int {
    if value.is_null() {
        return ffi::STATUS_BAD_ARGUMENT;
    }
    unsafe { *value = register_value(device(this).service, register) };
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn device_submit_read(
    this: RawObject,
    buffer: *mut u8,
    len: usize,
    timeout_ms: u32,
    callback: CompletionCallback,
    context: *mut c_void,
) -> c_int {
    if buffer.is_null() || len == 0 {
        return ffi::STATUS_BAD_ARGUMENT;
    }
    // Nothing in the worker touches `this`: the caller may release the
    // device while the read is in flight.
    let (service, duplicate) = {
        let device = unsafe { device(this) };
        (device.service, device.duplicate_completions)
    };
    let buffer = buffer as usize;
    let context = context as usize;

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_micros((context % 7) as u64 * 300));
        let status = if timeout_ms == 0 {
            ffi::STATUS_TIMEOUT
        } else {
            sentinel::check(buffer);
            unsafe { std::ptr::write_bytes(buffer as *mut u8, fill_byte(service), len) };
            ffi::STATUS_SUCCESS
        };
        let args = [len];
        let fire = || unsafe { callback(context as *mut c_void, status, args.as_ptr(), 1) };
        fire();
        if duplicate {
            fire();
        }
    });
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn device_reset(this: RawObject) -> c_int {
    unsafe { device(this) }.resets.fetch_add(1, Ordering::SeqCst);
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn facet_query(this: RawObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int {
    unsafe { answer(&*facet(this).device, capability, out) }
}

unsafe extern "C" fn facet_add_ref(this: RawObject) -> u32 {
    unsafe { device_add_ref(facet(this).device.cast_mut().cast()) }
}

unsafe extern "C" fn facet_release(this: RawObject) -> u32 {
    unsafe { device_release(facet(this).device.cast_mut().cast()) }
}

unsafe extern "C" fn facet_self_test(_this: RawObject) -> c_int {
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn factory_query(this: RawObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int {
    unsafe { answer(&*factory(this).device, capability, out) }
}

unsafe extern "C" fn factory_add_ref(this: RawObject) -> u32 {
    unsafe { factory(this) }.count.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "C" fn factory_release(this: RawObject) -> u32 {
    unsafe { factory(this) }.count.fetch_sub(1, Ordering::SeqCst) - 1
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Iterator ids the mock hands out start here.
pub const FIRST_ITERATOR: u32 = 0x100;

pub struct MockProvider {
    version: ProviderVersion,
    devices: Vec<Box<DeviceObject>>,
    pub factories_created: AtomicU32,
    pub factories_destroyed: AtomicU32,
    iterators: Mutex<HashMap<u32, usize>>,
    next_iterator: AtomicU32,
    registry_valid: AtomicBool,
    steps_until_stale: AtomicUsize,
    pub released: Mutex<Vec<ServiceId>>,
}

// SAFETY: device objects are only mutated through atomics; their table
// pointers target immutable statics.
unsafe impl Send for MockProvider {}
unsafe impl Sync for MockProvider {}

impl MockProvider {
    pub fn new(version: &str) -> Self {
        init_tracing();
        Self {
            version: version.parse().expect("mock version"),
            devices: vec![
                DeviceObject::boxed(1, false),
                DeviceObject::boxed(2, false),
                DeviceObject::boxed(3, true),
            ],
            factories_created: AtomicU32::new(0),
            factories_destroyed: AtomicU32::new(0),
            iterators: Mutex::new(HashMap::new()),
            next_iterator: AtomicU32::new(FIRST_ITERATOR),
            registry_valid: AtomicBool::new(true),
            steps_until_stale: AtomicUsize::new(usize::MAX),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self, service: u32) -> &DeviceObject {
        &self.devices[service as usize - 1]
    }

    /// Start a walk over every service.
    pub fn open_iterator(&self) -> ServiceId {
        let id = self.next_iterator.fetch_add(1, Ordering::SeqCst);
        lock(&self.iterators).insert(id, 0);
        ServiceId(id)
    }

    /// Change the registry under every open iterator.
    pub fn invalidate_iterators(&self) {
        self.registry_valid.store(false, Ordering::SeqCst);
    }

    /// Change the registry once iterators have yielded `steps` more services.
    pub fn invalidate_after(&self, steps: usize) {
        self.steps_until_stale.store(steps, Ordering::SeqCst);
    }

    pub fn released(&self) -> Vec<ServiceId> {
        lock(&self.released).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PluginProvider for MockProvider {
    fn name(&self) -> &str {
        "MOCK"
    }

    fn version(&self) -> Result<ProviderVersion> {
        Ok(self.version)
    }

    fn create_plugin_interface(&self, service: ServiceId, factory_type: CapabilityId) -> Result<RawObject> {
        if factory_type != FACTORY.capability_id() {
            return Err(NegotiationError::NativeError(ffi::STATUS_UNSUPPORTED));
        }
        let Some(device) = self.devices.get((service.0 as usize).wrapping_sub(1)) else {
            return Err(NegotiationError::NativeError(ffi::STATUS_NO_DEVICE));
        };
        self.factories_created.fetch_add(1, Ordering::SeqCst);
        let factory = Box::new(FactoryObject {
            table: &FACTORY_TABLE,
            count: AtomicU32::new(1),
            device: &**device,
        });
        Ok(Box::into_raw(factory).cast())
    }

    fn destroy_plugin_interface(&self, object: RawObject) -> Result<()> {
        self.factories_destroyed.fetch_add(1, Ordering::SeqCst);
        // SAFETY: only objects from `create_plugin_interface` come back here.
        drop(unsafe { Box::from_raw(object as *mut FactoryObject) });
        Ok(())
    }

    fn iterator_next(&self, iterator: ServiceId) -> Option<ServiceId> {
        let mut iterators = lock(&self.iterators);
        let position = iterators.get_mut(&iterator.0)?;
        let device = self.devices.get(*position)?;
        *position += 1;
        let left = self.steps_until_stale.load(Ordering::SeqCst);
        if left != usize::MAX {
            self.steps_until_stale.store(left.saturating_sub(1), Ordering::SeqCst);
            if left <= 1 {
                self.invalidate_iterators();
            }
        }
        Some(ServiceId(device.service))
    }

    fn iterator_is_valid(&self, iterator: ServiceId) -> bool {
        self.registry_valid.load(Ordering::SeqCst) && lock(&self.iterators).contains_key(&iterator.0)
    }

    fn release_object(&self, object: ServiceId) -> Result<()> {
        if object.0 >= FIRST_ITERATOR {
            lock(&self.iterators).remove(&object.0);
        }
        lock(&self.released).push(object);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sentinel buffers
// ---------------------------------------------------------------------------

/// Buffers that report their own reclamation, so a provider write into
/// reclaimed memory is caught before it happens.
pub mod sentinel {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{LazyLock, Mutex};

    use ioplug::OwnedBuffer;

    static LIVE: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));
    static USE_AFTER_RELEASE: AtomicUsize = AtomicUsize::new(0);

    /// A zeroed buffer tracked until it is reclaimed.
    pub fn lend(len: usize) -> OwnedBuffer {
        let mut buffer = OwnedBuffer::zeroed(len);
        let addr = buffer.as_mut_slice().as_mut_ptr() as usize;
        LIVE.lock().unwrap().insert(addr);
        buffer.on_reclaim(move || {
            LIVE.lock().unwrap().remove(&addr);
        })
    }

    /// Called by the provider right before it writes to `addr`.
    pub fn check(addr: usize) {
        if !LIVE.lock().unwrap().contains(&addr) {
            USE_AFTER_RELEASE.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn use_after_release() -> usize {
        USE_AFTER_RELEASE.load(Ordering::SeqCst)
    }
}
