// SPDX-License-Identifier: Apache-2.0
//! Capability negotiation.
//!
//! [`PluginFactory`] turns a service identity into a [`Binding`] for the
//! newest version of an interface the provider supports:
//!
//! 1. the provider builds a factory-shaped object for the service;
//! 2. the provider's version (read once, then cached) selects a descriptor
//!    from the requested interface's chain;
//! 3. the factory object is queried for that descriptor's capability, falling
//!    back to older descriptors if the provider rejects it;
//! 4. the factory object is torn down; the queried object lives on in the
//!    returned binding.

use std::sync::Arc;

use crate::binding::{Binding, Teardown};
use crate::chain::VersionedInterfaceChain;
use crate::cursor::ServiceCursor;
use crate::descriptor::InterfaceDescriptor;
use crate::error::{NegotiationError, Result};
use crate::provider::{PluginProvider, ServiceId};
use crate::version::{ProviderVersion, VersionCache};

/// Negotiates bindings against one provider.
pub struct PluginFactory {
    provider: Arc<dyn PluginProvider>,
    version: VersionCache,
}

impl PluginFactory {
    pub fn new(provider: Arc<dyn PluginProvider>) -> Self {
        Self {
            provider,
            version: VersionCache::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn PluginProvider> {
        &self.provider
    }

    /// The provider's version, read on first use and cached afterwards.
    pub fn provider_version(&self) -> Result<ProviderVersion> {
        self.version.get_or_read(|| self.provider.version())
    }

    /// Bind `target` on `service` through a factory object of type `factory`.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::ProviderUnavailable`] if the provider cannot build
    /// the factory object, [`NegotiationError::CapabilityUnsupported`] if no
    /// descriptor of `target` could be bound.
    pub fn create_binding(
        &self,
        service: ServiceId,
        factory: &'static InterfaceDescriptor,
        target: &VersionedInterfaceChain,
    ) -> Result<Binding> {
        let raw = self
            .provider
            .create_plugin_interface(service, factory.capability_id())
            .map_err(|e| match e {
                NegotiationError::NativeError(status) => NegotiationError::ProviderUnavailable {
                    service: service.0,
                    status,
                },
                other => other,
            })?;
        if raw.is_null() {
            tracing::warn!(
                "protocol violation: '{}' returned no factory object for service {service}",
                self.provider.name()
            );
            return Err(NegotiationError::ProviderUnavailable {
                service: service.0,
                status: crate::ffi::STATUS_ERROR,
            });
        }

        let factory_binding = Binding::adopt(raw, factory, Teardown::Destroy(Arc::clone(&self.provider)))?;
        let bound = self.query_capability(&factory_binding, target);
        drop(factory_binding);

        match &bound {
            Ok(binding) => tracing::debug!(
                "service {service} bound as {} via '{}'",
                binding.descriptor().name(),
                self.provider.name()
            ),
            Err(e) => tracing::debug!("binding service {service} failed: {e}"),
        }
        bound
    }

    /// Query `existing` for the newest supported version of `target`.
    ///
    /// A successful query takes a new provider reference on the returned
    /// object; the new binding releases it independently of `existing`.
    pub fn query_capability(&self, existing: &Binding, target: &VersionedInterfaceChain) -> Result<Binding> {
        let version = self.provider_version()?;
        let table = existing.table()?;

        for descriptor in target.candidates(version) {
            match table.query(descriptor.capability_id()) {
                Ok(raw) => return Binding::adopt(raw, descriptor, Teardown::Release),
                Err(NegotiationError::NativeError(status)) => {
                    tracing::trace!(
                        "'{}' rejected {} (status {status:#x}); trying older",
                        self.provider.name(),
                        descriptor.name()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(NegotiationError::CapabilityUnsupported {
            capability: target.select(version).capability_id(),
        })
    }

    /// Query `existing` for exactly `descriptor`, without version fallback.
    pub fn query_exact(&self, existing: &Binding, descriptor: &'static InterfaceDescriptor) -> Result<Binding> {
        descriptor.check_layout()?;
        match existing.table()?.query(descriptor.capability_id()) {
            Ok(raw) => Binding::adopt(raw, descriptor, Teardown::Release),
            Err(NegotiationError::NativeError(_)) => Err(NegotiationError::CapabilityUnsupported {
                capability: descriptor.capability_id(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Bind `target` on every service `cursor` yields.
    ///
    /// Stops at the first error; bindings created up to that point are
    /// released before the error is returned.
    pub fn bind_all(
        &self,
        cursor: &mut ServiceCursor,
        factory: &'static InterfaceDescriptor,
        target: &VersionedInterfaceChain,
    ) -> Result<Vec<Binding>> {
        let mut bindings = Vec::new();
        while let Some(service) = cursor.next_service()? {
            bindings.push(self.create_binding(service.id(), factory, target)?);
        }
        Ok(bindings)
    }
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("provider", &self.provider.name())
            .field("version", &self.version.get())
            .finish()
    }
}
