// SPDX-License-Identifier: Apache-2.0
//! Plugin providers.
//!
//! A provider is the native side of the negotiation: it turns a service
//! identity into a factory object, tears factory objects down again, walks
//! service iterators and releases service objects. [`PluginProvider`] is the
//! seam the rest of the crate talks through; [`NativeProvider`] implements it
//! on top of a shared library whose entry points carry a provider-specific
//! prefix:
//!
//! ```text
//! MOCK_create_plugin_interface
//! MOCK_destroy_plugin_interface
//! MOCK_iterator_next
//! MOCK_iterator_is_valid
//! MOCK_object_release
//! MOCK_provider_version      (optional)
//! ```

use std::ffi::CStr;
use std::path::Path;

use libloading::{Library, Symbol};

use crate::capability::CapabilityId;
use crate::config::ProviderConfig;
use crate::error::{NegotiationError, Result};
use crate::ffi::{self, RawObject, RawService};
use crate::version::ProviderVersion;

/// Native identity of a service object. `0` is never a valid service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub RawService);

impl ServiceId {
    pub const NONE: ServiceId = ServiceId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The operations the negotiation layer needs from a provider.
pub trait PluginProvider: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// The provider's runtime version, read from its distribution metadata.
    fn version(&self) -> Result<ProviderVersion>;

    /// Ask the provider for a factory-shaped object for `service`.
    ///
    /// On success the caller owns one reference to the returned object and
    /// must hand it back through [`PluginProvider::destroy_plugin_interface`].
    fn create_plugin_interface(&self, service: ServiceId, factory_type: CapabilityId) -> Result<RawObject>;

    /// Tear down an object obtained from
    /// [`PluginProvider::create_plugin_interface`].
    fn destroy_plugin_interface(&self, object: RawObject) -> Result<()>;

    /// Next service from an iterator; `None` once exhausted.
    fn iterator_next(&self, iterator: ServiceId) -> Option<ServiceId>;

    /// Whether the iterator is still consistent with the registry.
    fn iterator_is_valid(&self, iterator: ServiceId) -> bool;

    /// Drop one reference to a service or iterator object.
    fn release_object(&self, object: ServiceId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Shared-library provider
// ---------------------------------------------------------------------------

/// A provider loaded from a shared library with all entry points resolved.
///
/// The library handle is kept alive for the lifetime of this struct so the
/// library is not unloaded while we still hold function pointers into it.
pub struct NativeProvider {
    /// Prevent the shared library from being unloaded.
    _library: Library,

    prefix: String,
    library_path: String,
    configured_version: Option<ProviderVersion>,

    fn_create_plugin_interface: ffi::FnCreatePluginInterface,
    fn_destroy_plugin_interface: ffi::FnDestroyPluginInterface,
    fn_iterator_next: ffi::FnIteratorNext,
    fn_iterator_is_valid: ffi::FnIteratorIsValid,
    fn_object_release: ffi::FnObjectRelease,
    fn_provider_version: Option<ffi::FnProviderVersion>,
}

impl NativeProvider {
    /// Load the library named by `config` and resolve its entry points.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::LoadFailed`] if the library cannot be
    /// opened and [`NegotiationError::SymbolNotFound`] if a required entry
    /// point is missing.
    pub fn load(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;
        Self::load_path(&config.library, &config.symbol_prefix, config.parsed_version()?)
    }

    fn load_path(path: &Path, prefix: &str, configured_version: Option<ProviderVersion>) -> Result<Self> {
        let path_str = path.display().to_string();

        // SAFETY: we are loading an external shared library. The caller is
        // responsible for ensuring the library is trustworthy.
        let library = unsafe { Library::new(path) }.map_err(|e| NegotiationError::LoadFailed {
            path: path_str.clone(),
            cause: e.to_string(),
        })?;

        tracing::info!("loaded provider library '{path_str}' with prefix '{prefix}'");

        let fn_create_plugin_interface =
            resolve_required::<ffi::FnCreatePluginInterface>(&library, prefix, "create_plugin_interface")?;
        let fn_destroy_plugin_interface =
            resolve_required::<ffi::FnDestroyPluginInterface>(&library, prefix, "destroy_plugin_interface")?;
        let fn_iterator_next = resolve_required::<ffi::FnIteratorNext>(&library, prefix, "iterator_next")?;
        let fn_iterator_is_valid =
            resolve_required::<ffi::FnIteratorIsValid>(&library, prefix, "iterator_is_valid")?;
        let fn_object_release = resolve_required::<ffi::FnObjectRelease>(&library, prefix, "object_release")?;
        let fn_provider_version = resolve_optional::<ffi::FnProviderVersion>(&library, prefix, "provider_version");

        if configured_version.is_none() && fn_provider_version.is_none() {
            tracing::warn!("provider '{prefix}' exports no version and none is configured");
        }

        Ok(Self {
            _library: library,
            prefix: prefix.to_string(),
            library_path: path_str,
            configured_version,
            fn_create_plugin_interface,
            fn_destroy_plugin_interface,
            fn_iterator_next,
            fn_iterator_is_valid,
            fn_object_release,
            fn_provider_version,
        })
    }

    /// The entry-point prefix (e.g. `"MOCK"`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Filesystem path the library was loaded from.
    pub fn library_path(&self) -> &str {
        &self.library_path
    }

    fn exported_version(&self) -> Result<ProviderVersion> {
        let version_fn = self.fn_provider_version.ok_or_else(|| {
            NegotiationError::Config(format!("provider '{}' does not report a version", self.prefix))
        })?;
        let raw = unsafe { version_fn() };
        if raw.is_null() {
            return Err(NegotiationError::InvalidVersion("<null>".into()));
        }
        // SAFETY: the provider returns a static NUL-terminated string.
        let text = unsafe { CStr::from_ptr(raw) }
            .to_str()
            .map_err(|e| NegotiationError::InvalidVersion(format!("invalid UTF-8: {e}")))?;
        text.parse()
    }
}

impl PluginProvider for NativeProvider {
    fn name(&self) -> &str {
        &self.prefix
    }

    fn version(&self) -> Result<ProviderVersion> {
        match self.configured_version {
            Some(version) => Ok(version),
            None => self.exported_version(),
        }
    }

    fn create_plugin_interface(&self, service: ServiceId, factory_type: CapabilityId) -> Result<RawObject> {
        let mut out: RawObject = std::ptr::null_mut();
        let mut score: i32 = 0;
        let status =
            unsafe { (self.fn_create_plugin_interface)(service.0, factory_type.to_raw(), &mut out, &mut score) };
        if !ffi::is_success(status) {
            return Err(NegotiationError::ProviderUnavailable {
                service: service.0,
                status,
            });
        }
        if out.is_null() {
            tracing::warn!(
                "protocol violation: provider '{}' reported success but returned no factory for service {service}",
                self.prefix
            );
            return Err(NegotiationError::ProviderUnavailable {
                service: service.0,
                status: ffi::STATUS_ERROR,
            });
        }
        tracing::trace!("factory {factory_type} for service {service} created (score {score})");
        Ok(out)
    }

    fn destroy_plugin_interface(&self, object: RawObject) -> Result<()> {
        let status = unsafe { (self.fn_destroy_plugin_interface)(object) };
        crate::error::check_status(status)
    }

    fn iterator_next(&self, iterator: ServiceId) -> Option<ServiceId> {
        let next = ServiceId(unsafe { (self.fn_iterator_next)(iterator.0) });
        (!next.is_none()).then_some(next)
    }

    fn iterator_is_valid(&self, iterator: ServiceId) -> bool {
        unsafe { (self.fn_iterator_is_valid)(iterator.0) != 0 }
    }

    fn release_object(&self, object: ServiceId) -> Result<()> {
        let status = unsafe { (self.fn_object_release)(object.0) };
        crate::error::check_status(status)
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for NativeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeProvider")
            .field("prefix", &self.prefix)
            .field("library_path", &self.library_path)
            .field("configured_version", &self.configured_version)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Symbol resolution helpers
// ---------------------------------------------------------------------------

/// Construct the full prefixed symbol name: `{PREFIX}_{base_name}`.
fn prefixed_symbol(prefix: &str, base_name: &str) -> String {
    format!("{prefix}_{base_name}")
}

/// Resolve a required symbol. Returns an error if the symbol is missing.
fn resolve_required<T: Copy>(library: &Library, prefix: &str, base_name: &str) -> Result<T> {
    let sym_name = prefixed_symbol(prefix, base_name);
    tracing::trace!("resolving required symbol '{sym_name}'");

    // SAFETY: The caller guarantees the type `T` matches the actual function
    // signature exported by the library. This is the core FFI contract.
    unsafe {
        let sym: Symbol<T> = library
            .get(sym_name.as_bytes())
            .map_err(|e| NegotiationError::SymbolNotFound {
                symbol: sym_name.clone(),
                cause: e.to_string(),
            })?;
        Ok(*sym)
    }
}

/// Resolve an optional symbol. Returns `None` if the symbol is missing.
fn resolve_optional<T: Copy>(library: &Library, prefix: &str, base_name: &str) -> Option<T> {
    let sym_name = prefixed_symbol(prefix, base_name);
    tracing::trace!("resolving optional symbol '{sym_name}'");

    unsafe { library.get::<T>(sym_name.as_bytes()).ok().map(|s| *s) }
}
