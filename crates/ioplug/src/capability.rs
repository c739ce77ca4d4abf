// SPDX-License-Identifier: Apache-2.0
//! Capability identities.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::NegotiationError;
use crate::ffi::RawCapabilityId;

/// 128-bit identity of one interface shape. Compared by value only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId(Uuid);

impl CapabilityId {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The ABI form passed to `query_capability`.
    pub const fn to_raw(self) -> RawCapabilityId {
        RawCapabilityId {
            bytes: *self.0.as_bytes(),
        }
    }

    pub const fn from_raw(raw: RawCapabilityId) -> Self {
        Self::from_bytes(raw.bytes)
    }
}

impl From<Uuid> for CapabilityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for CapabilityId {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| NegotiationError::InvalidDescriptor(format!("bad capability id '{s}': {e}")))
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityId({})", self.0.hyphenated())
    }
}
