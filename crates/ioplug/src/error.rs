// SPDX-License-Identifier: Apache-2.0
//! Error types for plugin negotiation and binding lifecycle.

use crate::capability::CapabilityId;
use crate::ffi;

/// Errors arising from negotiating, binding or calling plugin interfaces.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("provider could not produce a factory table for service {service} (status {status:#x})")]
    ProviderUnavailable { service: u32, status: i32 },

    #[error("capability {capability} is not supported by the provider")]
    CapabilityUnsupported { capability: CapabilityId },

    #[error("call through a released or disposed binding")]
    DisposedHandle,

    #[error("provider returned status {0:#x}")]
    NativeError(i32),

    #[error("enumeration cursor was invalidated between calls")]
    StaleEnumeration,

    /// A provider-side contract breach. Absorbed where it is detected and
    /// reported through logs and violation counters; calls return the
    /// category the caller can act on instead.
    #[error("provider protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("slot {index} is outside the {slot_count}-slot layout of {capability}")]
    SlotOutOfRange {
        index: usize,
        slot_count: usize,
        capability: CapabilityId,
    },

    #[error("invalid interface descriptor chain: {0}")]
    InvalidDescriptor(String),

    #[error("invalid provider version '{0}'")]
    InvalidVersion(String),

    #[error("failed to load provider library at '{path}': {cause}")]
    LoadFailed { path: String, cause: String },

    #[error("symbol '{symbol}' not found in provider library: {cause}")]
    SymbolNotFound { symbol: String, cause: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    /// Wrap a raw provider status code. The code is surfaced verbatim.
    pub fn from_code(code: i32) -> Self {
        debug_assert!(!ffi::is_success(code));
        NegotiationError::NativeError(code)
    }

    /// The provider status carried by this error, if any.
    pub fn native_status(&self) -> Option<i32> {
        match self {
            NegotiationError::NativeError(code) => Some(*code),
            NegotiationError::ProviderUnavailable { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Map a provider status code to `Ok(())` or [`NegotiationError::NativeError`].
pub(crate) fn check_status(code: i32) -> Result<()> {
    if ffi::is_success(code) {
        Ok(())
    } else {
        Err(NegotiationError::from_code(code))
    }
}
