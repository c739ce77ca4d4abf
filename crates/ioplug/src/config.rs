// SPDX-License-Identifier: Apache-2.0
//! Provider configuration.
//!
//! Supports loading configuration from:
//! 1. A YAML file
//! 2. Environment variables (with `IOPLUG_` prefix)
//!
//! Environment variables take precedence over file values, which take
//! precedence over defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NegotiationError, Result};
use crate::version::ProviderVersion;

/// Where to find a provider library and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Path to the provider shared library (`.so` / `.dylib`).
    pub library: PathBuf,

    /// Prefix of the provider's exported entry points (e.g. `"MOCK"`).
    #[serde(default = "default_symbol_prefix")]
    pub symbol_prefix: String,

    /// Provider version from distribution metadata. When unset the library's
    /// `{PREFIX}_provider_version` export is asked instead.
    #[serde(default)]
    pub version: Option<String>,

    /// Timeout handed to the provider with asynchronous submissions.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u32,
}

fn default_symbol_prefix() -> String {
    "IOPLUG".to_string()
}

fn default_timeout_ms() -> u32 {
    5_000
}

impl ProviderConfig {
    pub fn new(library: impl Into<PathBuf>, symbol_prefix: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            symbol_prefix: symbol_prefix.into(),
            version: None,
            default_timeout_ms: default_timeout_ms(),
        }
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: ProviderConfig = serde_yaml_ng::from_str(&contents).map_err(|e| {
            NegotiationError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from environment variables alone.
    ///
    /// `IOPLUG_LIBRARY` is required.
    pub fn from_env() -> Result<Self> {
        let library = std::env::var("IOPLUG_LIBRARY")
            .map_err(|_| NegotiationError::Config("IOPLUG_LIBRARY is not set".into()))?;
        let mut config = Self::new(library, default_symbol_prefix());
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `IOPLUG_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(library) = std::env::var("IOPLUG_LIBRARY") {
            self.library = PathBuf::from(library);
        }
        if let Ok(prefix) = std::env::var("IOPLUG_SYMBOL_PREFIX") {
            self.symbol_prefix = prefix;
        }
        if let Ok(version) = std::env::var("IOPLUG_PROVIDER_VERSION") {
            self.version = Some(version);
        }
        if let Ok(timeout) = std::env::var("IOPLUG_DEFAULT_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(val) => self.default_timeout_ms = val,
                Err(_) => tracing::warn!("ignoring unparsable IOPLUG_DEFAULT_TIMEOUT_MS '{timeout}'"),
            }
        }
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.library.as_os_str().is_empty() {
            return Err(NegotiationError::Config("library path is empty".into()));
        }
        if self.symbol_prefix.is_empty()
            || !self
                .symbol_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(NegotiationError::Config(format!(
                "symbol prefix '{}' is not a valid C identifier prefix",
                self.symbol_prefix
            )));
        }
        if let Some(version) = &self.version {
            version.parse::<ProviderVersion>()?;
        }
        Ok(())
    }

    /// The configured version, parsed.
    pub fn parsed_version(&self) -> Result<Option<ProviderVersion>> {
        self.version.as_deref().map(str::parse).transpose()
    }
}
