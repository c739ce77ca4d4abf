// SPDX-License-Identifier: Apache-2.0
//! Provider runtime versions.
//!
//! Providers report a dotted `major.minor.patch` version in their
//! distribution metadata. It is parsed once and cached for the lifetime of
//! the process, see [`VersionCache`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{NegotiationError, Result};

/// Three-component version, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProviderVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ProviderVersion {
    type Err = NegotiationError;

    /// Parse `"1.8.2"`. Missing trailing components read as zero (`"2.1"` is
    /// `2.1.0`); more than three components or non-numeric parts are rejected.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(NegotiationError::InvalidVersion(s.to_string()));
        }

        let mut parts = [0u32; 3];
        let mut count = 0;
        for component in trimmed.split('.') {
            if count == parts.len() {
                return Err(NegotiationError::InvalidVersion(s.to_string()));
            }
            parts[count] = component
                .parse()
                .map_err(|_| NegotiationError::InvalidVersion(s.to_string()))?;
            count += 1;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for ProviderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Write-once cache for a provider's version.
#[derive(Debug, Default)]
pub struct VersionCache {
    cell: OnceLock<ProviderVersion>,
}

impl VersionCache {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Return the cached version, reading it with `read` on first use.
    ///
    /// A failed read is not cached; the next call tries again.
    pub fn get_or_read<F>(&self, read: F) -> Result<ProviderVersion>
    where
        F: FnOnce() -> Result<ProviderVersion>,
    {
        if let Some(version) = self.cell.get() {
            return Ok(*version);
        }
        let version = read()?;
        tracing::debug!("provider version resolved to {version}");
        Ok(*self.cell.get_or_init(|| version))
    }

    pub fn get(&self) -> Option<ProviderVersion> {
        self.cell.get().copied()
    }
}
