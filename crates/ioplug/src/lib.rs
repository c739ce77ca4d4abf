// SPDX-License-Identifier: Apache-2.0
//! # ioplug
//!
//! Safe negotiation with native device-framework plugins that expose
//! COM-style function tables.
//!
//! A provider hands out objects whose first word points at a table of C
//! function pointers. Slots 0-2 of every table are `query_capability`,
//! `add_ref` and `release`; newer interface versions only ever append slots.
//! This crate picks the newest interface version a provider supports, wraps
//! the returned object in a reference-counted [`Binding`] that fails fast
//! once torn down, and turns the provider's completion callbacks into
//! single-resolution futures.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────┐
//!                  │    device driver      │
//!                  └──────────┬───────────┘
//!                             │ VersionedInterfaceChain
//!                  ┌──────────┴───────────┐
//!                  │        ioplug        │
//!                  │                      │
//!                  │  PluginFactory       │ ← version select + fallback
//!                  │  Binding             │ ← refcounts, dispose-once
//!                  │  InterfaceTable      │ ← bounds-checked slots
//!                  │  AsyncCompletion-    │ ← token registry, buffers
//!                  │    Bridge            │
//!                  │  ServiceCursor       │ ← stale-aware enumeration
//!                  └──────────┬───────────┘
//!                             │ C ABI (extern "C")
//!               ┌─────────────┴─────────────┐
//!               │  provider library (.so)   │
//!               │  e.g. MOCK_create_...     │
//!               └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ioplug::{
//!     CapabilityId, InterfaceDescriptor, NativeProvider, PluginFactory, ProviderConfig,
//!     ProviderVersion, ServiceId, VersionedInterfaceChain,
//! };
//!
//! static FACTORY: InterfaceDescriptor = InterfaceDescriptor::new(
//!     "DeviceFactory",
//!     CapabilityId::from_u128(0x10F0),
//!     ProviderVersion::new(1, 0, 0),
//!     &ioplug::descriptor::HEADER_LAYOUT,
//! );
//! static DEVICE_V1: InterfaceDescriptor = InterfaceDescriptor::new(
//!     "Device",
//!     CapabilityId::from_u128(0x10A1),
//!     ProviderVersion::new(1, 0, 0),
//!     &["query_capability", "add_ref", "release", "read_register"],
//! );
//!
//! let config = ProviderConfig::from_file("provider.yaml").expect("bad config");
//! let provider = NativeProvider::load(&config).expect("failed to load provider");
//! let factory = PluginFactory::new(Arc::new(provider));
//!
//! let chain = VersionedInterfaceChain::new(&DEVICE_V1).expect("invalid chain");
//! let device = factory
//!     .create_binding(ServiceId(1), &FACTORY, &chain)
//!     .expect("negotiation failed");
//! println!("bound {}", device.descriptor().name());
//! ```

pub mod binding;
pub mod bridge;
pub mod capability;
pub mod chain;
pub mod config;
pub mod cursor;
pub mod descriptor;
pub mod error;
pub mod factory;
pub mod ffi;
pub mod handle;
pub mod notify;
pub mod provider;
pub mod table;
pub mod version;

#[cfg(test)]
mod fake;

// Re-export the most commonly used types at crate root.
pub use binding::{Binding, BindingState};
pub use bridge::{AsyncCompletionBridge, Completed, FromCompletionArgs, OwnedBuffer, PendingCompletion, SubmitOptions};
pub use capability::CapabilityId;
pub use chain::VersionedInterfaceChain;
pub use config::ProviderConfig;
pub use cursor::{ServiceCursor, ServiceHandle};
pub use descriptor::InterfaceDescriptor;
pub use error::{NegotiationError, Result};
pub use factory::PluginFactory;
pub use handle::HandleGuard;
pub use notify::{Notification, NotificationHub, Subscription};
pub use provider::{NativeProvider, PluginProvider, ServiceId};
pub use table::InterfaceTable;
pub use version::ProviderVersion;
