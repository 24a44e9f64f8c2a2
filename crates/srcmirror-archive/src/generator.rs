//! Generator-backed archive: mirrors each source file as a generated
//! artifact in the archive directory.
//!
//! Artifacts are produced into a temp file in the archive directory and
//! renamed into place, then stamped with the source file's modification
//! time so outdated checks reduce to an mtime comparison. The rename into
//! place retries a bounded number of times to ride out transient sharing
//! violations from other processes reading the artifact.

use crate::mapping::NameMapping;
use crate::store::ArchiveStore;
use filetime::FileTime;
use srcmirror_core::error::{MirrorError, Result};
use srcmirror_core::events::FileEventKind;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const PERSIST_ATTEMPTS: u32 = 10;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Produces one artifact file from one source file.
pub trait Generator: Send + Sync {
    /// Transform `input` into an artifact at `output`. `output` already
    /// exists as an empty temp file; implementations overwrite it.
    fn generate(&self, input: &Path, output: &Path) -> anyhow::Result<()>;

    /// Source extensions this generator accepts, lowercase with leading
    /// dots.
    fn supported_extensions(&self) -> &[String];

    /// Read the source path an existing artifact was generated from, when
    /// the artifact format embeds it. Used to rebuild the name mapping
    /// after the mapping file is lost.
    fn embedded_source_path(&self, _artifact: &Path) -> Option<PathBuf> {
        None
    }
}

/// Backend that stores generator output, one artifact per source file.
pub struct GeneratorStore {
    generator: Arc<dyn Generator>,
    mapping: NameMapping,
    archive_dir: PathBuf,
}

impl GeneratorStore {
    /// Open the archive at `archive_dir` for artifacts with
    /// `target_extension`. When `use_existing` is false, artifacts already
    /// on disk are deleted; their mapping entries are kept so later
    /// allocations never reuse a previously issued name.
    pub fn new(
        archive_dir: impl AsRef<Path>,
        target_extension: &str,
        use_existing: bool,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let archive_dir = std::path::absolute(archive_dir.as_ref())?;
        fs::create_dir_all(&archive_dir)?;

        let probe_generator = Arc::clone(&generator);
        let probe = move |artifact: &Path| probe_generator.embedded_source_path(artifact);
        let mapping = NameMapping::new(&archive_dir, target_extension, &probe)?;

        if !use_existing {
            for artifact in mapping.target_files() {
                debug!("discarding existing artifact {}", artifact.display());
                fs::remove_file(&artifact)?;
            }
        }

        Ok(Self {
            generator,
            mapping,
            archive_dir,
        })
    }

    pub fn archive_directory(&self) -> &Path {
        &self.archive_dir
    }

    fn source_mtime(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    fn artifact_mtime(&self, source_path: &Path) -> Result<Option<SystemTime>> {
        let Some(target) = self.existing_target(source_path) else {
            return Ok(None);
        };
        Ok(Self::source_mtime(&target))
    }

    /// Target path for `source_path` only if the artifact file exists.
    /// Looking up an unseen source still allocates its mapping slot; the
    /// allocated name is simply reused once the artifact is generated.
    fn existing_target(&self, source_path: &Path) -> Option<PathBuf> {
        let source_path = std::path::absolute(source_path).ok()?;
        let target = self.mapping.target_path_for(&source_path).ok()?;
        target.exists().then_some(target)
    }

    fn generate_output(&self, source_path: &Path) -> Result<()> {
        let source_path = std::path::absolute(source_path)?;
        let target = self.mapping.target_path_for(&source_path)?;
        let source_mtime = fs::metadata(&source_path)?.modified()?;

        let tmp = tempfile::NamedTempFile::new_in(&self.archive_dir)?;
        self.generator
            .generate(&source_path, tmp.path())
            .map_err(|e| MirrorError::generation(source_path.clone(), e))?;

        let mut pending = tmp;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match pending.persist(&target) {
                Ok(_) => break,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        attempt,
                        "retrying artifact rename to {}: {}",
                        target.display(),
                        e.error
                    );
                    pending = e.file;
                    std::thread::sleep(PERSIST_RETRY_DELAY);
                }
                Err(e) => return Err(MirrorError::Io(e.error)),
            }
        }

        filetime::set_file_mtime(&target, FileTime::from_system_time(source_mtime))?;
        Ok(())
    }
}

impl ArchiveStore for GeneratorStore {
    fn supported_extensions(&self) -> &[String] {
        self.generator.supported_extensions()
    }

    fn contains(&self, source_path: &Path) -> bool {
        self.existing_target(source_path).is_some()
    }

    /// Outdated when exactly one of source and artifact exists, or both
    /// exist with different modification times. The artifact carries the
    /// source's mtime from generation time, so equality means current.
    fn is_outdated(&self, source_path: &Path) -> Result<bool> {
        let source_path = std::path::absolute(source_path)?;
        let live = Self::source_mtime(&source_path);
        let archived = self.artifact_mtime(&source_path)?;
        Ok(match (live, archived) {
            (None, None) => false,
            (Some(live), Some(archived)) => live != archived,
            _ => true,
        })
    }

    fn files(&self) -> Vec<PathBuf> {
        self.mapping
            .target_files()
            .into_iter()
            .filter_map(|target| self.mapping.source_path_for(&target))
            .collect()
    }

    fn add_or_update_impl(&self, source_path: &Path) -> Result<Option<FileEventKind>> {
        let existed = self.contains(source_path);
        self.generate_output(source_path)?;
        Ok(Some(if existed {
            FileEventKind::Changed
        } else {
            FileEventKind::Added
        }))
    }

    fn delete_impl(&self, source_path: &Path) -> Result<bool> {
        match self.existing_target(source_path) {
            Some(target) => {
                fs::remove_file(&target)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Renames regenerate: the artifact may embed the source path, so the
    /// old artifact is deleted and a fresh one generated for the new path.
    fn rename_impl(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        self.delete_impl(old_path)?;
        let new_abs = std::path::absolute(new_path)?;
        if new_abs.exists() {
            self.generate_output(&new_abs)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn save(&self) -> Result<()> {
        self.mapping.save_mapping()
    }
}
