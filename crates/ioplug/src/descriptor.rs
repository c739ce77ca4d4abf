// SPDX-License-Identifier: Apache-2.0
//! Static interface descriptors.
//!
//! A descriptor names one version of an interface: its capability identity,
//! the oldest provider version that implements it, and the ordered layout of
//! its function table. Newer versions point at the version they extend, so
//! the descriptors of one interface form a chain from newest to oldest.
//!
//! ```rust
//! use ioplug::{CapabilityId, InterfaceDescriptor, ProviderVersion};
//!
//! static SENSOR_V1: InterfaceDescriptor = InterfaceDescriptor::new(
//!     "Sensor",
//!     CapabilityId::from_u128(0x0e9b_0001),
//!     ProviderVersion::new(1, 0, 0),
//!     &["query_capability", "add_ref", "release", "read_value"],
//! );
//!
//! static SENSOR_V2: InterfaceDescriptor = InterfaceDescriptor::new(
//!     "Sensor2",
//!     CapabilityId::from_u128(0x0e9b_0002),
//!     ProviderVersion::new(2, 0, 0),
//!     &["query_capability", "add_ref", "release", "read_value", "read_async"],
//! )
//! .extends(&SENSOR_V1);
//!
//! assert!(SENSOR_V2.is_prefix_compatible());
//! ```

use std::fmt;

use crate::capability::CapabilityId;
use crate::error::{NegotiationError, Result};
use crate::ffi;
use crate::version::ProviderVersion;

/// Slot names every layout must start with.
pub const HEADER_LAYOUT: [&str; ffi::HEADER_SLOTS] = ["query_capability", "add_ref", "release"];

/// Metadata for one version of an interface.
pub struct InterfaceDescriptor {
    name: &'static str,
    capability_id: CapabilityId,
    min_provider_version: ProviderVersion,
    layout: &'static [&'static str],
    parent: Option<&'static InterfaceDescriptor>,
}

impl InterfaceDescriptor {
    /// A descriptor with no parent. `layout` lists every slot, header included.
    pub const fn new(
        name: &'static str,
        capability_id: CapabilityId,
        min_provider_version: ProviderVersion,
        layout: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            capability_id,
            min_provider_version,
            layout,
            parent: None,
        }
    }

    /// Declare that this descriptor appends slots to `parent`.
    pub const fn extends(mut self, parent: &'static InterfaceDescriptor) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capability_id(&self) -> CapabilityId {
        self.capability_id
    }

    pub fn min_provider_version(&self) -> ProviderVersion {
        self.min_provider_version
    }

    pub fn slot_count(&self) -> usize {
        self.layout.len()
    }

    pub fn layout(&self) -> &'static [&'static str] {
        self.layout
    }

    pub fn parent(&self) -> Option<&'static InterfaceDescriptor> {
        self.parent
    }

    /// Index of the named slot, if this layout has it.
    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.layout.iter().position(|slot| *slot == name)
    }

    /// Whether this layout starts with the fixed header and with every slot of
    /// its parent, in order.
    pub fn is_prefix_compatible(&self) -> bool {
        self.check_layout().is_ok()
    }

    pub(crate) fn check_layout(&self) -> Result<()> {
        if self.layout.len() < ffi::HEADER_SLOTS || self.layout[..ffi::HEADER_SLOTS] != HEADER_LAYOUT {
            return Err(NegotiationError::InvalidDescriptor(format!(
                "{} does not start with the {:?} header",
                self.name, HEADER_LAYOUT
            )));
        }

        let Some(parent) = self.parent else {
            return Ok(());
        };

        if self.layout.len() < parent.layout.len() {
            return Err(NegotiationError::InvalidDescriptor(format!(
                "{} has {} slots but extends {} with {}",
                self.name,
                self.layout.len(),
                parent.name,
                parent.layout.len()
            )));
        }

        if let Some(index) = parent
            .layout
            .iter()
            .zip(self.layout)
            .position(|(inherited, own)| inherited != own)
        {
            return Err(NegotiationError::InvalidDescriptor(format!(
                "{} slot {index} is '{}' but {} defines it as '{}'",
                self.name, self.layout[index], parent.name, parent.layout[index]
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDescriptor")
            .field("name", &self.name)
            .field("capability_id", &self.capability_id)
            .field("min_provider_version", &self.min_provider_version)
            .field("slot_count", &self.slot_count())
            .field("parent", &self.parent.map(|p| p.name))
            .finish()
    }
}

impl PartialEq for InterfaceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.capability_id == other.capability_id
    }
}

impl Eq for InterfaceDescriptor {}
