//! Handle subsystem configuration
//!
//! Values come from defaults, an optional TOML file (`toml-config` feature) and
//! `CEXT_*` environment variables, in increasing order of precedence.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Complete configuration for a [`crate::HandleManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Serialize native calls behind a reentrant per-thread lock
    pub native_call_lock: bool,
    /// Number of kept objects after which all markers run
    pub marking_cache_size: usize,
    /// Maximum number of interned small-integer wrappers (0 = no interning)
    pub integer_cache_limit: usize,
    /// Count every minted handle and block for diagnostics
    pub handle_statistics: bool,
    /// Debug mode: keep every minted wrapper alive for the manager's lifetime
    pub keep_handles_alive: bool,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            native_call_lock: true,
            marking_cache_size: 100,
            integer_cache_limit: 1024,
            handle_statistics: false,
            keep_handles_alive: false,
        }
    }
}

impl HandleConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// Unparseable values are ignored and leave the default in place.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_lookup(lookup);
        config
    }

    /// Merge with environment variables (env vars take precedence)
    pub fn merge_with_env(mut self) -> Self {
        self.apply_lookup(|key| std::env::var(key).ok());
        self
    }

    fn apply_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CEXT_LOCK").and_then(|v| parse_flag(&v)) {
            self.native_call_lock = val;
        }

        if let Some(val) = lookup("CEXT_MARKING_CACHE").and_then(|v| v.parse::<usize>().ok()) {
            // A zero-sized cache would run markers on every kept object.
            self.marking_cache_size = val.max(1);
        }

        if let Some(val) = lookup("CEXT_INTEGER_CACHE").and_then(|v| v.parse::<usize>().ok()) {
            self.integer_cache_limit = val;
        }

        if let Some(val) = lookup("CEXT_HANDLE_STATS").and_then(|v| parse_flag(&v)) {
            self.handle_statistics = val;
        }

        if let Some(val) = lookup("CEXT_KEEP_HANDLES_ALIVE").and_then(|v| parse_flag(&v)) {
            self.keep_handles_alive = val;
        }
    }

    /// Load configuration from TOML file
    #[cfg(feature = "toml-config")]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: HandleConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn from_file(_path: &Path) -> anyhow::Result<Self> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Save configuration to TOML file
    #[cfg(feature = "toml-config")]
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Save configuration to TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn save_to_file(&self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
