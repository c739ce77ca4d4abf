// SPDX-License-Identifier: Apache-2.0
//! Version selection across the descriptors of one interface.

use crate::descriptor::InterfaceDescriptor;
use crate::error::{NegotiationError, Result};
use crate::version::ProviderVersion;

/// The validated newest-to-oldest chain of one interface's descriptors.
#[derive(Debug, Clone, Copy)]
pub struct VersionedInterfaceChain {
    newest: &'static InterfaceDescriptor,
}

impl VersionedInterfaceChain {
    /// Validate the chain ending at `newest`.
    ///
    /// Every link must extend its parent's layout without reordering, and the
    /// minimum provider versions must not increase walking towards the oldest
    /// descriptor.
    pub fn new(newest: &'static InterfaceDescriptor) -> Result<Self> {
        let mut current = newest;
        loop {
            current.check_layout()?;
            let Some(parent) = current.parent() else {
                break;
            };
            if parent.min_provider_version() > current.min_provider_version() {
                return Err(NegotiationError::InvalidDescriptor(format!(
                    "{} requires {} but its parent {} requires the newer {}",
                    current.name(),
                    current.min_provider_version(),
                    parent.name(),
                    parent.min_provider_version()
                )));
            }
            if parent.capability_id() == current.capability_id() {
                return Err(NegotiationError::InvalidDescriptor(format!(
                    "{} and its parent {} share capability {}",
                    current.name(),
                    parent.name(),
                    current.capability_id()
                )));
            }
            current = parent;
        }
        Ok(Self { newest })
    }

    pub fn newest(&self) -> &'static InterfaceDescriptor {
        self.newest
    }

    pub fn oldest(&self) -> &'static InterfaceDescriptor {
        self.iter().last().unwrap_or(self.newest)
    }

    /// Number of descriptors in the chain.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Descriptors from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &'static InterfaceDescriptor> + use<> {
        std::iter::successors(Some(self.newest), |d| d.parent())
    }

    /// The newest descriptor whose minimum version `version` satisfies
    /// (inclusive). Falls back to the oldest descriptor when the provider is
    /// older than all of them.
    pub fn select(&self, version: ProviderVersion) -> &'static InterfaceDescriptor {
        match self.iter().find(|d| d.min_provider_version() <= version) {
            Some(descriptor) => descriptor,
            None => {
                let oldest = self.oldest();
                tracing::debug!(
                    "provider {version} predates {} (requires {}); using base shape",
                    oldest.name(),
                    oldest.min_provider_version()
                );
                oldest
            }
        }
    }

    /// The selected descriptor followed by every older one.
    pub fn candidates(
        &self,
        version: ProviderVersion,
    ) -> impl Iterator<Item = &'static InterfaceDescriptor> + use<> {
        std::iter::successors(Some(self.select(version)), |d| d.parent())
    }
}
