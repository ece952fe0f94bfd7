//! Flat key=value property files used by the config store.
//!
//! The format is deliberately small: one `key=value` pair per line, `#`
//! starts a comment line, everything is UTF-8. Keys are kept sorted so that
//! saved files are deterministic.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// An ordered set of string key/value pairs with typed accessors.
///
/// Typed getters fall back to the supplied default when the key is missing
/// or fails to parse, mirroring how config types absorb partial files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse properties from text. Malformed lines (no `=`) are skipped.
    pub fn parse_str(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { entries }
    }

    pub fn load_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse_str(&text))
    }

    /// Write the properties to disk with a leading comment header.
    pub fn save_file(&self, path: &Path, header: &str) -> std::io::Result<()> {
        let mut out = String::new();
        for line in header.lines() {
            let _ = writeln!(out, "# {line}");
        }
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key}={value}");
        }
        std::fs::write(path, out)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Comma-separated list value; empty or missing yields the default.
    pub fn get_list(&self, key: &str, default: &[String]) -> Vec<String> {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => default.to_vec(),
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_u32(&mut self, key: &str, value: u32) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_f64(&mut self, key: &str, value: f64) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn set_list(&mut self, key: &str, value: &[String]) {
        self.entries.insert(key.to_string(), value.join(","));
    }
}
