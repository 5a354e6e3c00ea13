//! Scan options and persisted settings.

use std::fs;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ScanError;

/// Default cap on concurrently running package-list processes.
pub const DEFAULT_MAX_PARALLEL_PROCESSES: usize = 6;

/// Per-scan behavior switches.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct ScanOptions {
    /// Descend into subdirectories that live on a different filesystem.
    ///
    /// When disabled (the default), mount points are flagged and left in
    /// `OnRequestOnly` without reading their content.
    #[builder(default = "false")]
    #[serde(default)]
    pub cross_filesystems: bool,
}

impl ScanOptions {
    /// Create a scan options builder.
    pub fn builder() -> ScanOptionsBuilder {
        ScanOptionsBuilder::default()
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            cross_filesystems: false,
        }
    }
}

/// Settings for reading installed packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgSettings {
    /// Cap on concurrently running file-list processes.
    #[serde(default = "default_max_parallel_processes")]
    pub max_parallel_processes: usize,
}

fn default_max_parallel_processes() -> usize {
    DEFAULT_MAX_PARALLEL_PROCESSES
}

impl Default for PkgSettings {
    fn default() -> Self {
        Self {
            max_parallel_processes: DEFAULT_MAX_PARALLEL_PROCESSES,
        }
    }
}

/// Settings persisted as TOML under the user config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// The `[pkg]` group.
    #[serde(default)]
    pub pkg: PkgSettings,
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("densitree").join("settings.toml"))
    }

    /// Load settings from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ScanError::io(path, e)),
        };
        toml::from_str(&raw).map_err(|e| ScanError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Load from the default location, falling back to defaults on any
    /// problem (a broken settings file must not block scanning).
    pub fn load_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        match Self::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring unreadable settings: {e}");
                Self::default()
            }
        }
    }

    /// Write settings to a file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ScanError::io(parent, e))?;
        }
        let raw = toml::to_string_pretty(self).map_err(|e| ScanError::Config {
            message: e.to_string(),
        })?;
        fs::write(path, raw).map_err(|e| ScanError::io(path, e))
    }
}
