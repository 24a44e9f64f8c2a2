//! Bidirectional source-path to artifact-path mapping with collision-safe
//! short names.
//!
//! Every artifact lives directly in the target directory under the name
//! `<leaf>.<N>.<ext>`, where N is a per-leaf-name occurrence counter. The
//! counter only ever grows: it is derived at load time from the highest
//! suffix seen, so re-adding a previously-seen leaf name can never collide
//! with a live mapping. The mapping persists to a pipe-delimited
//! `mapping.txt` inside the target directory.

use regex::Regex;
use srcmirror_core::config::MAPPING_FILE_NAME;
use srcmirror_core::error::{MirrorError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Hook that reads the source path embedded in an artifact file. Used to
/// reconstruct the mapping when the mapping file is missing.
pub type SourcePathProbe<'a> = &'a dyn Fn(&Path) -> Option<PathBuf>;

#[derive(Default)]
struct MappingState {
    /// folded source path -> target path
    forward: HashMap<String, PathBuf>,
    /// folded target path -> source path
    reverse: HashMap<String, PathBuf>,
    /// folded leaf name -> highest suffix seen
    name_count: HashMap<String, u32>,
    /// original (source, target) pairs, in insertion order, for persistence
    entries: Vec<(PathBuf, PathBuf)>,
}

/// Thread-safe bidirectional name mapping for one archive directory.
pub struct NameMapping {
    target_dir: PathBuf,
    target_extension: String,
    case_insensitive: bool,
    suffix_pattern: Regex,
    changed: AtomicBool,
    state: parking_lot::Mutex<MappingState>,
}

impl NameMapping {
    /// Open or create the mapping for `target_dir`.
    ///
    /// If a mapping file exists it is loaded; otherwise the mapping is
    /// reconstructed by scanning existing target files and asking `probe`
    /// for each file's embedded source path. Target files that yield no
    /// source path are deleted as orphans.
    pub fn new(
        target_dir: impl AsRef<Path>,
        target_extension: &str,
        probe: SourcePathProbe<'_>,
    ) -> Result<Self> {
        let target_extension = target_extension.trim_start_matches('.').to_string();
        if target_extension.is_empty() {
            return Err(MirrorError::invalid_input(
                "target extension cannot be empty",
            ));
        }

        let target_dir = std::path::absolute(target_dir.as_ref())?;
        fs::create_dir_all(&target_dir)?;

        let suffix_pattern = Regex::new(&format!(
            r"\.(\d+)\.{}$",
            regex::escape(&target_extension)
        ))
        .map_err(|e| MirrorError::mapping(format!("bad suffix pattern: {e}")))?;

        let mapping = Self {
            case_insensitive: directory_is_case_insensitive(&target_dir),
            target_dir,
            target_extension,
            suffix_pattern,
            changed: AtomicBool::new(false),
            state: parking_lot::Mutex::new(MappingState::default()),
        };

        let mapping_path = mapping.mapping_file_path();
        if mapping_path.exists() {
            mapping.load_mapping_file(&mapping_path)?;
        } else {
            mapping.reconstruct_from_target_files(probe)?;
        }

        Ok(mapping)
    }

    /// The directory holding the mapped artifact files.
    pub fn target_directory(&self) -> &Path {
        &self.target_dir
    }

    /// The extension (without leading dot) of the mapped artifact files.
    pub fn target_extension(&self) -> &str {
        &self.target_extension
    }

    fn mapping_file_path(&self) -> PathBuf {
        self.target_dir.join(MAPPING_FILE_NAME)
    }

    fn fold(&self, s: &str) -> String {
        if self.case_insensitive {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    }

    fn key(&self, path: &Path) -> String {
        self.fold(&path.to_string_lossy())
    }

    /// Target path for `source_path`, allocating a new collision-safe name
    /// on the first call for an unseen source. Idempotent.
    pub fn target_path_for(&self, source_path: &Path) -> Result<PathBuf> {
        if source_path.as_os_str().is_empty() {
            return Err(MirrorError::invalid_input("source path cannot be empty"));
        }
        let source_path = std::path::absolute(source_path)?;
        let key = self.key(&source_path);

        let mut state = self.state.lock();
        if let Some(target) = state.forward.get(&key) {
            return Ok(target.clone());
        }

        let leaf = source_path
            .file_name()
            .ok_or_else(|| {
                MirrorError::invalid_input(format!(
                    "source path has no file name: {}",
                    source_path.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();

        let count_key = self.fold(&leaf);
        let n = state.name_count.get(&count_key).copied().unwrap_or(0) + 1;
        state.name_count.insert(count_key, n);

        let target = self
            .target_dir
            .join(format!("{leaf}.{n}.{}", self.target_extension));
        self.insert(&mut state, source_path, target.clone());
        self.changed.store(true, Ordering::SeqCst);
        Ok(target)
    }

    /// Reverse lookup. Relative `target_path`s are resolved against the
    /// target directory. Returns `None` for unknown targets.
    pub fn source_path_for(&self, target_path: &Path) -> Option<PathBuf> {
        let target_path = if target_path.is_absolute() {
            target_path.to_path_buf()
        } else {
            self.target_dir.join(target_path)
        };
        self.state.lock().reverse.get(&self.key(&target_path)).cloned()
    }

    /// All artifact files currently on disk in the target directory.
    pub fn target_files(&self) -> Vec<PathBuf> {
        let suffix = format!(".{}", self.target_extension);
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.target_dir) {
            Ok(entries) => entries,
            Err(_) => return files,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            {
                files.push(path);
            }
        }
        files
    }

    /// Write the mapping to disk if anything changed since the last save.
    /// The write goes to a temp file first and is renamed into place.
    pub fn save_mapping(&self) -> Result<()> {
        if !self.changed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = (|| -> Result<()> {
            let state = self.state.lock();
            let mut tmp = tempfile::NamedTempFile::new_in(&self.target_dir)?;
            for (source, target) in &state.entries {
                writeln!(tmp, "{}|{}", source.display(), target.display())?;
            }
            tmp.persist(self.mapping_file_path())
                .map_err(|e| MirrorError::Io(e.error))?;
            Ok(())
        })();

        if result.is_err() {
            // keep the dirty flag so a later save retries
            self.changed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn insert(&self, state: &mut MappingState, source: PathBuf, target: PathBuf) {
        state.forward.insert(self.key(&source), target.clone());
        state.reverse.insert(self.key(&target), source.clone());
        state.entries.push((source, target));
    }

    /// Record one loaded entry and fold its suffix into the counter.
    fn process_entry(&self, state: &mut MappingState, source: PathBuf, target: PathBuf) {
        let target_str = target.to_string_lossy().into_owned();
        if let (Some(captures), Some(leaf)) =
            (self.suffix_pattern.captures(&target_str), source.file_name())
        {
            if let Ok(n) = captures[1].parse::<u32>() {
                let count_key = self.fold(&leaf.to_string_lossy());
                let current = state.name_count.get(&count_key).copied().unwrap_or(0);
                state.name_count.insert(count_key, current.max(n));
            }
        }
        self.insert(state, source, target);
    }

    fn load_mapping_file(&self, mapping_path: &Path) -> Result<()> {
        let contents = fs::read_to_string(mapping_path)?;
        let mut state = self.state.lock();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 2 {
                warn!(
                    "skipping malformed mapping line (expected 2 fields, got {}): {line}",
                    parts.len()
                );
                continue;
            }
            self.process_entry(
                &mut state,
                PathBuf::from(parts[0].trim()),
                PathBuf::from(parts[1].trim()),
            );
        }
        debug!(
            entries = state.entries.len(),
            "loaded name mapping from {}",
            mapping_path.display()
        );
        Ok(())
    }

    fn reconstruct_from_target_files(&self, probe: SourcePathProbe<'_>) -> Result<()> {
        let targets = self.target_files();
        let mut state = self.state.lock();
        for target in targets {
            match probe(&target) {
                Some(source) => {
                    let source = std::path::absolute(&source)?;
                    self.process_entry(&mut state, source, target);
                    self.changed.store(true, Ordering::SeqCst);
                }
                None => {
                    warn!(
                        "deleting orphaned artifact with no embedded source path: {}",
                        target.display()
                    );
                    let _ = fs::remove_file(&target);
                }
            }
        }
        Ok(())
    }
}

impl Drop for NameMapping {
    fn drop(&mut self) {
        if let Err(e) = self.save_mapping() {
            warn!("failed to save name mapping on drop: {e}");
        }
    }
}

/// Probe whether the directory's filesystem folds case, by creating a
/// throwaway file and statting its upper-cased name.
fn directory_is_case_insensitive(directory: &Path) -> bool {
    let name = uuid::Uuid::new_v4().to_string();
    let probe_path = directory.join(&name);
    let created = fs::File::create(&probe_path).is_ok();
    if !created {
        return false;
    }
    let insensitive = directory.join(name.to_uppercase()).exists();
    let _ = fs::remove_file(&probe_path);
    insensitive
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn no_probe(_: &Path) -> Option<PathBuf> {
        None
    }

    fn new_mapping(dir: &TempDir) -> NameMapping {
        NameMapping::new(dir.path(), "xml", &no_probe).unwrap()
    }

    #[test]
    fn test_target_path_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mapping = new_mapping(&dir);

        let first = mapping.target_path_for(Path::new("/project/src/foo.c")).unwrap();
        let second = mapping.target_path_for(Path::new("/project/src/foo.c")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_same_leaf_gets_distinct_targets() {
        let dir = TempDir::new().unwrap();
        let mapping = new_mapping(&dir);

        let a = mapping.target_path_for(Path::new("/project/a/foo.c")).unwrap();
        let b = mapping.target_path_for(Path::new("/project/b/foo.c")).unwrap();
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("foo.c.1.xml"));
        assert!(b.to_string_lossy().ends_with("foo.c.2.xml"));
    }

    #[test]
    fn test_reverse_lookup() {
        let dir = TempDir::new().unwrap();
        let mapping = new_mapping(&dir);

        let target = mapping.target_path_for(Path::new("/project/src/foo.c")).unwrap();
        assert_eq!(
            mapping.source_path_for(&target),
            Some(PathBuf::from("/project/src/foo.c"))
        );
        assert_eq!(mapping.source_path_for(Path::new("/nope.xml")), None);
    }

    #[test]
    fn test_relative_target_resolves_against_target_dir() {
        let dir = TempDir::new().unwrap();
        let mapping = new_mapping(&dir);

        let target = mapping.target_path_for(Path::new("/project/src/foo.c")).unwrap();
        let leaf = target.file_name().unwrap();
        assert_eq!(
            mapping.source_path_for(Path::new(leaf)),
            Some(PathBuf::from("/project/src/foo.c"))
        );
    }

    #[test]
    fn test_reload_keeps_counters_growing() {
        let dir = TempDir::new().unwrap();
        {
            let mapping = new_mapping(&dir);
            mapping.target_path_for(Path::new("/a/foo.c")).unwrap();
            mapping.target_path_for(Path::new("/b/foo.c")).unwrap();
            mapping.save_mapping().unwrap();
        }

        let mapping = new_mapping(&dir);
        let third = mapping.target_path_for(Path::new("/c/foo.c")).unwrap();
        assert!(
            third.to_string_lossy().ends_with("foo.c.3.xml"),
            "expected suffix above both persisted ones, got {}",
            third.display()
        );
        // persisted entries still resolve
        assert_eq!(
            mapping.source_path_for(&mapping.target_path_for(Path::new("/a/foo.c")).unwrap()),
            Some(PathBuf::from("/a/foo.c"))
        );
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MAPPING_FILE_NAME),
            "/a/foo.c|/t/foo.c.1.xml\ngarbage line without delimiter\n/b/bar.c|/t/bar.c.1.xml\n",
        )
        .unwrap();

        let mapping = new_mapping(&dir);
        assert!(mapping.source_path_for(Path::new("/t/foo.c.1.xml")).is_some());
        assert!(mapping.source_path_for(Path::new("/t/bar.c.1.xml")).is_some());
    }

    #[test]
    fn test_reconstruction_deletes_orphans() {
        let dir = TempDir::new().unwrap();
        let known = dir.path().join("foo.c.1.xml");
        let orphan = dir.path().join("stale.c.1.xml");
        fs::write(&known, "known").unwrap();
        fs::write(&orphan, "orphan").unwrap();

        let probe = |artifact: &Path| -> Option<PathBuf> {
            (artifact.file_name().unwrap() == "foo.c.1.xml")
                .then(|| PathBuf::from("/project/foo.c"))
        };
        let mapping = NameMapping::new(dir.path(), "xml", &probe).unwrap();

        assert!(!orphan.exists(), "orphan artifact should be deleted");
        assert_eq!(
            mapping.source_path_for(&known),
            Some(PathBuf::from("/project/foo.c"))
        );
        // counter derived from the reconstructed suffix
        let next = mapping.target_path_for(Path::new("/other/foo.c")).unwrap();
        assert!(next.to_string_lossy().ends_with("foo.c.2.xml"));
    }

    #[test]
    fn test_save_only_when_dirty() {
        let dir = TempDir::new().unwrap();
        let mapping = new_mapping(&dir);
        mapping.target_path_for(Path::new("/a/foo.c")).unwrap();
        mapping.save_mapping().unwrap();

        let mtime = fs::metadata(dir.path().join(MAPPING_FILE_NAME))
            .unwrap()
            .modified()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        mapping.save_mapping().unwrap();
        let mtime_after = fs::metadata(dir.path().join(MAPPING_FILE_NAME))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime, mtime_after, "clean mapping should not rewrite the file");
    }

    proptest! {
        /// Bijection: distinct sources get distinct targets, and the reverse
        /// lookup returns the original source for every mapped path.
        #[test]
        fn prop_mapping_is_a_bijection(names in prop::collection::hash_set("[a-z]{1,8}", 1..20)) {
            let dir = TempDir::new().unwrap();
            let mapping = new_mapping(&dir);

            let sources: Vec<PathBuf> = names
                .iter()
                .flat_map(|n| {
                    [
                        PathBuf::from(format!("/left/{n}.c")),
                        PathBuf::from(format!("/right/{n}.c")),
                    ]
                })
                .collect();

            let mut targets = std::collections::HashSet::new();
            for source in &sources {
                let target = mapping.target_path_for(source).unwrap();
                prop_assert!(targets.insert(target.clone()), "duplicate target {}", target.display());
                prop_assert_eq!(mapping.source_path_for(&target), Some(source.clone()));
            }
        }
    }
}
