//! Isolated code-loading scopes over dynamic libraries.
//!
//! Each loaded unit owns one [`CodeScope`]. Dropping the scope releases the
//! library; the manager guarantees the unit instance and every closure it
//! produced are dropped first, since their code lives inside the library.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

use libloading::{Library, Symbol};

use crate::units::Unit;

type ManifestFn = unsafe extern "C" fn() -> *const c_char;
type CreateFn = unsafe extern "C" fn() -> *mut Box<dyn Unit>;

/// Symbol exporting the embedded TOML manifest.
const MANIFEST_SYMBOL: &[u8] = b"unit_manifest";

/// An open dynamic-library scope for one unit.
pub(crate) struct CodeScope {
    library: Library,
}

impl CodeScope {
    /// Open the package at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        // SAFETY: loading a library runs its initializers. Unit packages
        // are built against this crate's contract and installed by the
        // operator; the modules directory is trusted input.
        let library = unsafe { Library::new(path) }
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
        Ok(Self { library })
    }

    /// Read the embedded manifest without keeping the library open.
    pub fn read_manifest(path: &Path) -> Result<String, String> {
        let scope = Self::open(path)?;
        scope.manifest_text()
    }

    fn manifest_text(&self) -> Result<String, String> {
        // SAFETY: the manifest symbol is declared by `declare_unit!` and
        // returns a pointer to a NUL-terminated static string.
        let manifest: Symbol<'_, ManifestFn> = unsafe { self.library.get(MANIFEST_SYMBOL) }
            .map_err(|e| format!("missing unit_manifest symbol: {e}"))?;
        let raw = unsafe { manifest() };
        if raw.is_null() {
            return Err("unit_manifest returned null".to_string());
        }
        let text = unsafe { CStr::from_ptr(raw) }
            .to_str()
            .map_err(|e| format!("manifest is not valid UTF-8: {e}"))?;
        Ok(text.to_string())
    }

    /// Resolve the entry symbol and construct the unit instance.
    pub fn create_instance(&self, entry_symbol: &str) -> Result<Box<dyn Unit>, String> {
        // SAFETY: the entry symbol is declared by `declare_unit!` and
        // returns a raw double-boxed trait object, or null when the
        // constructor panicked.
        let create: Symbol<'_, CreateFn> = unsafe { self.library.get(entry_symbol.as_bytes()) }
            .map_err(|e| format!("missing entry symbol '{entry_symbol}': {e}"))?;
        let raw = unsafe { create() };
        if raw.is_null() {
            return Err(format!("entry symbol '{entry_symbol}' returned null"));
        }
        let boxed = unsafe { Box::from_raw(raw) };
        Ok(*boxed)
    }
}
