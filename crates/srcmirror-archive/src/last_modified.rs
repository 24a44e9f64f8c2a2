//! Timestamp archive: remembers the last-seen modification time of every
//! monitored file and answers outdated queries against the live filesystem.
//!
//! Persists to a pipe-delimited text file of `path|nanos-since-epoch`
//! lines. Nanoseconds round-trip `SystemTime` exactly on every platform
//! this runs on, so a reloaded archive never spuriously reports files as
//! outdated.

use crate::store::ArchiveStore;
use dashmap::DashMap;
use srcmirror_core::error::Result;
use srcmirror_core::events::FileEventKind;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Backend that archives only modification timestamps.
pub struct LastModifiedStore {
    timestamps: DashMap<PathBuf, SystemTime>,
    save_path: PathBuf,
    changed: AtomicBool,
    /// A timestamp archive accepts any file, so this stays empty and the
    /// monitor treats it as extension-agnostic.
    extensions: Vec<String>,
}

impl LastModifiedStore {
    /// Open the store persisted at `save_path`, loading any existing state.
    pub fn new(save_path: impl Into<PathBuf>) -> Result<Self> {
        let save_path = std::path::absolute(save_path.into())?;
        if let Some(parent) = save_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let store = Self {
            timestamps: DashMap::new(),
            save_path,
            changed: AtomicBool::new(false),
            extensions: Vec::new(),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        if !self.save_path.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.save_path)?;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((path, nanos)) = line.rsplit_once('|') else {
                warn!("skipping malformed timestamp line: {line}");
                continue;
            };
            let Ok(nanos) = nanos.trim().parse::<u64>() else {
                warn!("skipping timestamp line with unparsable nanos: {line}");
                continue;
            };
            self.timestamps.insert(
                PathBuf::from(path),
                UNIX_EPOCH + Duration::from_nanos(nanos),
            );
        }
        debug!(
            entries = self.timestamps.len(),
            "loaded timestamp archive from {}",
            self.save_path.display()
        );
        Ok(())
    }

    fn live_mtime(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

impl ArchiveStore for LastModifiedStore {
    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn contains(&self, source_path: &Path) -> bool {
        match std::path::absolute(source_path) {
            Ok(path) => self.timestamps.contains_key(&path),
            Err(_) => false,
        }
    }

    /// Outdated when exactly one side exists, or both exist with different
    /// modification times.
    fn is_outdated(&self, source_path: &Path) -> Result<bool> {
        let path = std::path::absolute(source_path)?;
        let live = Self::live_mtime(&path);
        let stored = self.timestamps.get(&path).map(|entry| *entry.value());
        Ok(match (live, stored) {
            (None, None) => false,
            (Some(live), Some(stored)) => live != stored,
            _ => true,
        })
    }

    fn files(&self) -> Vec<PathBuf> {
        self.timestamps
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn add_or_update_impl(&self, source_path: &Path) -> Result<Option<FileEventKind>> {
        let path = std::path::absolute(source_path)?;
        let mtime = fs::metadata(&path)?.modified()?;
        let existed = self.timestamps.insert(path, mtime).is_some();
        self.changed.store(true, Ordering::SeqCst);
        Ok(Some(if existed {
            FileEventKind::Changed
        } else {
            FileEventKind::Added
        }))
    }

    fn delete_impl(&self, source_path: &Path) -> Result<bool> {
        let path = std::path::absolute(source_path)?;
        let removed = self.timestamps.remove(&path).is_some();
        if removed {
            self.changed.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn rename_impl(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let removed = self.delete_impl(old_path)?;
        let added = self.add_or_update_impl(new_path)?.is_some();
        Ok(removed || added)
    }

    fn save(&self) -> Result<()> {
        if !self.changed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = (|| -> Result<()> {
            let dir = self
                .save_path
                .parent()
                .unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            for entry in self.timestamps.iter() {
                let nanos = entry
                    .value()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                writeln!(tmp, "{}|{nanos}", entry.key().display())?;
            }
            tmp.persist(&self.save_path)
                .map_err(|e| srcmirror_core::error::MirrorError::Io(e.error))?;
            Ok(())
        })();

        if result.is_err() {
            self.changed.store(true, Ordering::SeqCst);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, name).unwrap();
        path
    }

    #[test]
    fn test_unknown_existing_file_is_outdated() {
        let dir = TempDir::new().unwrap();
        let source = write_source(&dir, "a.c");
        let store = LastModifiedStore::new(dir.path().join("map.txt")).unwrap();
        assert!(store.is_outdated(&source).unwrap());
    }

    #[test]
    fn test_archived_unchanged_file_is_current() {
        let dir = TempDir::new().unwrap();
        let source = write_source(&dir, "a.c");
        let store = LastModifiedStore::new(dir.path().join("map.txt")).unwrap();

        assert_eq!(
            store.add_or_update_impl(&source).unwrap(),
            Some(FileEventKind::Added)
        );
        assert!(!store.is_outdated(&source).unwrap());
        assert_eq!(
            store.add_or_update_impl(&source).unwrap(),
            Some(FileEventKind::Changed)
        );
    }

    #[test]
    fn test_touched_file_becomes_outdated() {
        let dir = TempDir::new().unwrap();
        let source = write_source(&dir, "a.c");
        let store = LastModifiedStore::new(dir.path().join("map.txt")).unwrap();
        store.add_or_update_impl(&source).unwrap();

        let later = filetime::FileTime::from_unix_time(4_000_000_000, 0);
        filetime::set_file_mtime(&source, later).unwrap();
        assert!(store.is_outdated(&source).unwrap());
    }

    #[test]
    fn test_deleted_archived_file_is_outdated() {
        let dir = TempDir::new().unwrap();
        let source = write_source(&dir, "a.c");
        let store = LastModifiedStore::new(dir.path().join("map.txt")).unwrap();
        store.add_or_update_impl(&source).unwrap();

        fs::remove_file(&source).unwrap();
        assert!(store.is_outdated(&source).unwrap());

        assert!(store.delete_impl(&source).unwrap());
        assert!(!store.is_outdated(&source).unwrap());
        assert!(!store.delete_impl(&source).unwrap());
    }

    #[test]
    fn test_roundtrip_through_save_file() {
        let dir = TempDir::new().unwrap();
        let source = write_source(&dir, "a.c");
        let save_path = dir.path().join("map.txt");
        {
            let store = LastModifiedStore::new(&save_path).unwrap();
            store.add_or_update_impl(&source).unwrap();
            store.save().unwrap();
        }

        let reloaded = LastModifiedStore::new(&save_path).unwrap();
        assert!(reloaded.contains(&source));
        assert!(
            !reloaded.is_outdated(&source).unwrap(),
            "persisted timestamp must compare equal after reload"
        );
        assert_eq!(reloaded.files(), vec![std::path::absolute(&source).unwrap()]);
    }

    #[test]
    fn test_malformed_save_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let save_path = dir.path().join("map.txt");
        fs::write(&save_path, "/a/b.c|12345\nno delimiter here\n/c/d.c|not-a-number\n").unwrap();

        let store = LastModifiedStore::new(&save_path).unwrap();
        assert_eq!(store.files(), vec![PathBuf::from("/a/b.c")]);
    }

    #[test]
    fn test_rename_moves_timestamp() {
        let dir = TempDir::new().unwrap();
        let old = write_source(&dir, "old.c");
        let store = LastModifiedStore::new(dir.path().join("map.txt")).unwrap();
        store.add_or_update_impl(&old).unwrap();

        let new = dir.path().join("new.c");
        fs::rename(&old, &new).unwrap();
        assert!(store.rename_impl(&old, &new).unwrap());
        assert!(!store.contains(&old));
        assert!(store.contains(&new));
    }
}
