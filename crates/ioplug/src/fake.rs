// SPDX-License-Identifier: Apache-2.0
//! In-process provider objects for unit tests.

use std::os::raw::c_int;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::capability::CapabilityId;
use crate::descriptor::InterfaceDescriptor;
use crate::error::{NegotiationError, Result};
use crate::ffi::{self, RawCapabilityId, RawObject, TableHeader};
use crate::provider::{PluginProvider, ServiceId};
use crate::version::ProviderVersion;

pub const SENSOR_VALUE: u32 = 0x5e_5e;

pub static SENSOR_V1: InterfaceDescriptor = InterfaceDescriptor::new(
    "Sensor",
    CapabilityId::from_u128(0xA1),
    ProviderVersion::new(1, 0, 0),
    &["query_capability", "add_ref", "release", "read_value"],
);

pub static SENSOR_V2: InterfaceDescriptor = InterfaceDescriptor::new(
    "Sensor2",
    CapabilityId::from_u128(0xA2),
    ProviderVersion::new(2, 0, 0),
    &["query_capability", "add_ref", "release", "read_value", "reset"],
)
.extends(&SENSOR_V1);

pub static FACTORY: InterfaceDescriptor = InterfaceDescriptor::new(
    "Factory",
    CapabilityId::from_u128(0xF0),
    ProviderVersion::new(1, 0, 0),
    &["query_capability", "add_ref", "release"],
);

pub type FnReadValue = unsafe extern "C" fn(this: RawObject, value: *mut u32) -> c_int;
pub type FnReset = unsafe extern "C" fn(this: RawObject) -> c_int;

#[repr(C)]
struct SensorTable {
    header: TableHeader,
    read_value: FnReadValue,
    reset: FnReset,
}

static SENSOR_TABLE: SensorTable = SensorTable {
    header: TableHeader {
        query_capability: fake_query,
        add_ref: fake_add_ref,
        release: fake_release,
    },
    read_value: fake_read_value,
    reset: fake_reset,
};

#[repr(C)]
struct Inner {
    table: *const SensorTable,
    count: AtomicU32,
    releases: AtomicU32,
    accepts: Vec<CapabilityId>,
    hollow: AtomicBool,
}

/// A heap object whose table answers for the capabilities it was built with.
///
/// Queries hand out the same object with its count bumped, the way a
/// provider returning `this` for an implemented interface does.
pub struct FakeObject {
    inner: Box<Inner>,
}

// SAFETY: the table pointer targets an immutable static; counters are atomic.
unsafe impl Send for FakeObject {}
unsafe impl Sync for FakeObject {}

impl FakeObject {
    pub fn new(descriptor: &'static InterfaceDescriptor) -> Self {
        let accepts = std::iter::successors(Some(descriptor), |d| d.parent())
            .map(|d| d.capability_id())
            .collect();
        Self::accepting(accepts)
    }

    pub fn accepting(accepts: Vec<CapabilityId>) -> Self {
        Self {
            inner: Box::new(Inner {
                table: &SENSOR_TABLE,
                count: AtomicU32::new(1),
                releases: AtomicU32::new(0),
                accepts,
                hollow: AtomicBool::new(false),
            }),
        }
    }

    pub fn as_raw(&self) -> RawObject {
        (&*self.inner as *const Inner).cast_mut().cast()
    }

    pub fn count(&self) -> u32 {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Make accepted queries succeed without handing out an object.
    pub fn answer_hollow(&self) {
        self.inner.hollow.store(true, Ordering::SeqCst);
    }
}

unsafe fn inner<'a>(this: RawObject) -> &'a Inner {
    unsafe { &*(this as *const Inner) }
}

unsafe extern "C" fn fake_query(this: RawObject, capability: RawCapabilityId, out: *mut RawObject) -> c_int {
    let object = unsafe { inner(this) };
    if object.accepts.contains(&CapabilityId::from_raw(capability)) {
        if object.hollow.load(Ordering::SeqCst) {
            return ffi::STATUS_SUCCESS;
        }
        object.count.fetch_add(1, Ordering::SeqCst);
        unsafe { *out = this };
        ffi::STATUS_SUCCESS
    } else {
        ffi::STATUS_NO_INTERFACE
    }
}

unsafe extern "C" fn fake_add_ref(this: RawObject) -> u32 {
    unsafe { inner(this) }.count.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "C" fn fake_release(this: RawObject) -> u32 {
    let object = unsafe { inner(this) };
    object.releases.fetch_add(1, Ordering::SeqCst);
    object.count.fetch_sub(1, Ordering::SeqCst) - 1
}

unsafe extern "C" fn fake_read_value(_this: RawObject, value: *mut u32) -> c_int {
    unsafe { *value = SENSOR_VALUE };
    ffi::STATUS_SUCCESS
}

unsafe extern "C" fn fake_reset(_this: RawObject) -> c_int {
    ffi::STATUS_SUCCESS
}

/// A provider whose factory object accepts a fixed set of capabilities.
pub struct FakeProvider {
    pub version: ProviderVersion,
    pub factory: FakeObject,
    pub destroyed: AtomicU32,
    pub version_reads: AtomicU32,
    pub unavailable: bool,
    /// Report success from `create_plugin_interface` without an object.
    pub hollow_factory: bool,
    pub services: Mutex<Vec<ServiceId>>,
    pub valid: AtomicBool,
    pub released_objects: Mutex<Vec<ServiceId>>,
}

impl FakeProvider {
    pub fn new(version: ProviderVersion, accepts: Vec<CapabilityId>) -> Self {
        Self {
            version,
            factory: FakeObject::accepting(accepts),
            destroyed: AtomicU32::new(0),
            version_reads: AtomicU32::new(0),
            unavailable: false,
            hollow_factory: false,
            services: Mutex::new(Vec::new()),
            valid: AtomicBool::new(true),
            released_objects: Mutex::new(Vec::new()),
        }
    }
}

impl PluginProvider for FakeProvider {
    fn name(&self) -> &str {
        "FAKE"
    }

    fn version(&self) -> Result<ProviderVersion> {
        self.version_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.version)
    }

    fn create_plugin_interface(&self, service: ServiceId, _factory_type: CapabilityId) -> Result<RawObject> {
        if self.unavailable {
            return Err(NegotiationError::ProviderUnavailable {
                service: service.0,
                status: ffi::STATUS_NO_DEVICE,
            });
        }
        if self.hollow_factory {
            return Ok(std::ptr::null_mut());
        }
        self.factory.inner.count.fetch_add(1, Ordering::SeqCst);
        Ok(self.factory.as_raw())
    }

    fn destroy_plugin_interface(&self, object: RawObject) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        unsafe { fake_release(object) };
        Ok(())
    }

    fn iterator_next(&self, _iterator: ServiceId) -> Option<ServiceId> {
        let mut services = self.services.lock().unwrap();
        if services.is_empty() {
            None
        } else {
            Some(services.remove(0))
        }
    }

    fn iterator_is_valid(&self, _iterator: ServiceId) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn release_object(&self, object: ServiceId) -> Result<()> {
        self.released_objects.lock().unwrap().push(object);
        Ok(())
    }
}
