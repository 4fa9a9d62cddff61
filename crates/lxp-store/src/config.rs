use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Flush/sync strategy for record and log writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// `fsync` every file before it becomes visible (safest, slowest).
    EveryWrite,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Configuration consumed by [`Store::open`](crate::Store::open).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the store. Created if missing.
    pub root: PathBuf,
    #[serde(default)]
    pub sync: SyncMode,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sync: SyncMode::default(),
        }
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> StoreResult<Self> {
        toml::from_str(source).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let source = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&source)
    }
}
