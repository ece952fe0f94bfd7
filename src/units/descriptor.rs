//! Unit package descriptors parsed from embedded manifests.
//!
//! A unit package is a dynamic library exporting a `unit_manifest` symbol
//! that returns TOML text describing the unit. The descriptor is immutable
//! once parsed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// File extensions recognized as unit packages.
pub const PACKAGE_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

/// Entry symbol resolved when the manifest does not name one.
pub const DEFAULT_ENTRY_SYMBOL: &str = "unit_create";

/// Unit ids are lowercase: `[a-z][a-z0-9_]*`.
pub fn is_valid_unit_id(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    entry_symbol: Option<String>,
    /// Comma-separated hard dependency ids.
    #[serde(default)]
    depends: Option<String>,
    /// Comma-separated soft dependency ids.
    #[serde(default)]
    soft_depends: Option<String>,
}

fn split_dependency_list(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Immutable metadata describing a unit package on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    id: String,
    version: String,
    entry_symbol: String,
    hard_dependencies: BTreeSet<String>,
    soft_dependencies: BTreeSet<String>,
    package_path: PathBuf,
}

impl UnitDescriptor {
    /// Build a descriptor, validating the unit id.
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        entry_symbol: impl Into<String>,
        hard_dependencies: BTreeSet<String>,
        soft_dependencies: BTreeSet<String>,
        package_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let id = id.into();
        if !is_valid_unit_id(&id) {
            return Err(CoreError::Load {
                unit: id.clone(),
                detail: "unit id must match [a-z][a-z0-9_]*".to_string(),
            });
        }
        Ok(Self {
            id,
            version: version.into(),
            entry_symbol: entry_symbol.into(),
            hard_dependencies,
            soft_dependencies,
            package_path: package_path.into(),
        })
    }

    /// Parse the manifest text embedded in the package at `package_path`.
    /// A missing id derives from the entry symbol, lowercased.
    pub fn parse_manifest(package_path: &Path, manifest: &str) -> Result<Self> {
        let package_name = package_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| package_path.display().to_string());

        let raw: RawManifest = toml::from_str(manifest).map_err(|e| CoreError::Load {
            unit: package_name,
            detail: format!("invalid manifest: {e}"),
        })?;

        let entry_symbol = raw
            .entry_symbol
            .unwrap_or_else(|| DEFAULT_ENTRY_SYMBOL.to_string());
        let id = raw
            .id
            .unwrap_or_else(|| entry_symbol.to_ascii_lowercase());

        Self::new(
            id,
            raw.version.unwrap_or_else(|| "1.0.0".to_string()),
            entry_symbol,
            split_dependency_list(raw.depends.as_deref()),
            split_dependency_list(raw.soft_depends.as_deref()),
            package_path,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn entry_symbol(&self) -> &str {
        &self.entry_symbol
    }

    pub fn hard_dependencies(&self) -> &BTreeSet<String> {
        &self.hard_dependencies
    }

    pub fn soft_dependencies(&self) -> &BTreeSet<String> {
        &self.soft_dependencies
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }
}
