//! Storage layout and scan configuration.
//!
//! Everything the monitor persists (name mappings, last-modified maps, the
//! monitored-directories list, generated artifacts) lives under one storage
//! root handed in by the host. Monitored source trees are read-only; the
//! storage root must never sit inside one of them, and file events for paths
//! under the storage root are dropped to avoid feedback loops.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of seconds between directory scans.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

/// File name for the persisted list of monitored directories.
pub const MONITOR_LIST_FILE_NAME: &str = "monitored_directories.txt";

/// File name for the last-modified archive's map.
pub const LAST_MODIFIED_FILE_NAME: &str = "lastmodifiedmap.txt";

/// File name for a name mapping, stored inside its target directory.
pub const MAPPING_FILE_NAME: &str = "mapping.txt";

/// Where the monitor and its archives keep their state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the persisted monitored-directories list.
    pub fn monitor_list_path(&self) -> PathBuf {
        self.root.join(MONITOR_LIST_FILE_NAME)
    }

    /// Path of the last-modified archive's save file.
    pub fn last_modified_path(&self) -> PathBuf {
        self.root.join(LAST_MODIFIED_FILE_NAME)
    }

    /// Directory for one named archive's artifacts.
    pub fn archive_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// True if `path` is inside the storage root. Checked on every file
    /// event so the mirror never reacts to its own writes.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

/// Configuration for the directory scanning monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Time between scans of the monitored directories.
    pub interval: Duration,

    /// Bounded fan-out for the concurrent startup pass.
    pub startup_parallelism: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            startup_parallelism: 2,
        }
    }
}
