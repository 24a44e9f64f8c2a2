//! Extension-based routing of file changes into archives.
//!
//! A [`FileMonitor`] owns a set of hosted archives, routes each incoming
//! path to the archive registered for its extension (falling back to the
//! default archive), and reconciles archives against a [`FileSource`] at
//! startup. Paths inside the monitor's own storage directory are never
//! routed; the mirror must not archive itself.

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use srcmirror_archive::Archive;
use srcmirror_core::config::{ScanConfig, StorageLayout};
use srcmirror_core::error::Result;
use srcmirror_core::events::{FileEvent, ReadyNotifier, Subscribers, Subscription};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Anything that can enumerate the files a monitor should mirror.
pub trait FileSource: Send + Sync {
    fn files(&self) -> Vec<PathBuf>;
}

impl FileSource for Vec<PathBuf> {
    fn files(&self) -> Vec<PathBuf> {
        self.clone()
    }
}

/// Routes file changes to archives by extension.
pub struct FileMonitor {
    storage: StorageLayout,
    archives: Vec<Arc<Archive>>,
    /// lowercase extension with leading dot -> archive
    by_extension: HashMap<String, Arc<Archive>>,
    default_archive: Option<Arc<Archive>>,
    file_changed: Subscribers<FileEvent>,
    startup_completed: Subscribers<()>,
    monitoring_stopped: Subscribers<()>,
    /// Number of registered archives currently busy; drives the aggregated
    /// readiness edges.
    busy_archives: Arc<AtomicUsize>,
    ready: Arc<ReadyNotifier>,
    /// Keeps the per-archive fan-in subscriptions alive.
    fan_in: Mutex<Vec<Subscription>>,
}

impl FileMonitor {
    pub fn new(storage: StorageLayout) -> Self {
        Self {
            storage,
            archives: Vec::new(),
            by_extension: HashMap::new(),
            default_archive: None,
            file_changed: Subscribers::new(),
            startup_completed: Subscribers::new(),
            monitoring_stopped: Subscribers::new(),
            busy_archives: Arc::new(AtomicUsize::new(0)),
            ready: Arc::new(ReadyNotifier::new()),
            fan_in: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    /// Register an archive for every extension it supports. A later
    /// registration for the same extension wins. The default archive
    /// receives files whose extension no archive claims.
    pub fn register_archive(&mut self, archive: Arc<Archive>, is_default: bool) {
        let sink = self.file_changed.clone();
        let sub = archive.on_file_changed(move |event| sink.emit(event));
        self.fan_in.lock().push(sub);

        // per-archive edges alternate, so the busy count gives exactly one
        // aggregated edge per all-idle/any-busy transition
        let busy = Arc::clone(&self.busy_archives);
        let ready = Arc::clone(&self.ready);
        let sub = archive.on_ready_changed(move |is_ready| {
            if *is_ready {
                if busy.fetch_sub(1, Ordering::SeqCst) == 1 {
                    ready.set(true);
                }
            } else if busy.fetch_add(1, Ordering::SeqCst) == 0 {
                ready.set(false);
            }
        });
        self.fan_in.lock().push(sub);

        for extension in archive.supported_extensions() {
            let key = extension.to_lowercase();
            if self.by_extension.contains_key(&key) {
                warn!("extension {key} re-registered, later archive takes over");
            }
            self.by_extension.insert(key, Arc::clone(&archive));
        }
        if is_default {
            self.default_archive = Some(Arc::clone(&archive));
        }
        self.archives.push(archive);
    }

    /// Archive responsible for `path`, by lowercase extension then default.
    pub fn archive_for(&self, path: &Path) -> Option<&Arc<Archive>> {
        let key = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()));
        key.and_then(|key| self.by_extension.get(&key))
            .or(self.default_archive.as_ref())
    }

    pub fn archives(&self) -> &[Arc<Archive>] {
        &self.archives
    }

    /// All archived source paths across every registered archive.
    pub fn archived_files(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for archive in &self.archives {
            for file in archive.files() {
                if seen.insert(file.clone()) {
                    files.push(file);
                }
            }
        }
        files
    }

    pub fn is_ready(&self) -> bool {
        self.archives.iter().all(|archive| archive.is_ready())
    }

    /// Subscribe to aggregated readiness edges: `false` when any archive
    /// leaves idle while the rest are idle, `true` when the last busy
    /// archive finishes.
    pub fn on_ready_changed(
        &self,
        callback: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.ready.subscribe(callback)
    }

    /// Subscribe to change events from every registered archive.
    pub fn on_file_changed(
        &self,
        callback: impl Fn(&FileEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.file_changed.subscribe(callback)
    }

    pub fn on_startup_completed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        self.startup_completed.subscribe(callback)
    }

    pub fn on_monitoring_stopped(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        self.monitoring_stopped.subscribe(callback)
    }

    fn routable(&self, path: &Path) -> bool {
        if self.storage.contains(path) {
            debug!("ignoring path inside storage directory: {}", path.display());
            return false;
        }
        true
    }

    pub fn add_or_update_file(&self, path: &Path) -> Result<()> {
        if !self.routable(path) {
            return Ok(());
        }
        match self.archive_for(path) {
            Some(archive) => archive.add_or_update_file(path),
            None => Ok(()),
        }
    }

    /// The archive resolves added-vs-changed itself, so adds and updates
    /// share one path.
    pub fn add_file(&self, path: &Path) -> Result<()> {
        self.add_or_update_file(path)
    }

    pub fn update_file(&self, path: &Path) -> Result<()> {
        self.add_or_update_file(path)
    }

    pub fn delete_file(&self, path: &Path) -> Result<()> {
        if !self.routable(path) {
            return Ok(());
        }
        match self.archive_for(path) {
            Some(archive) => archive.delete_file(path),
            None => Ok(()),
        }
    }

    pub fn rename_file(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        if !self.routable(new_path) {
            return Ok(());
        }
        match self.archive_for(new_path) {
            Some(archive) => archive.rename_file(old_path, new_path),
            None => Ok(()),
        }
    }

    /// Bring every archive in line with `source`: refresh files the
    /// archives consider outdated, then drop archived files the source no
    /// longer has. One file's failure never aborts the rest; per-file
    /// errors are logged and skipped.
    pub fn reconcile(&self, source: &dyn FileSource) -> Result<()> {
        let files = source.files();
        for path in &files {
            if let Err(e) = self.update_if_outdated(path) {
                warn!("failed to refresh {}: {e}", path.display());
            }
        }
        self.delete_vanished(&files);
        Ok(())
    }

    /// Serial [`reconcile`](Self::reconcile) that announces completion.
    pub fn startup(&self, source: &dyn FileSource) -> Result<()> {
        self.reconcile(source)?;
        self.startup_completed.emit(&());
        Ok(())
    }

    /// Like [`startup`](Self::startup), but fans the refresh pass out over
    /// a bounded rayon pool. Files that fail in the parallel pass are
    /// retried serially before the failure is reported.
    pub fn startup_concurrent(&self, source: &dyn FileSource, config: &ScanConfig) -> Result<()> {
        use rayon::prelude::*;

        let files = source.files();
        let missed: SegQueue<PathBuf> = SegQueue::new();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.startup_parallelism)
            .build()
            .map_err(|e| srcmirror_core::error::MirrorError::monitor(e.to_string()))?;

        pool.install(|| {
            files.par_iter().for_each(|path| {
                if let Err(e) = self.update_if_outdated(path) {
                    warn!("startup pass failed for {}, will retry: {e}", path.display());
                    missed.push(path.clone());
                }
            });
        });

        // one serial retry for files the parallel pass missed
        while let Some(path) = missed.pop() {
            if let Err(e) = self.update_if_outdated(&path) {
                warn!("giving up on {}: {e}", path.display());
            }
        }

        self.delete_vanished(&files);
        self.startup_completed.emit(&());
        Ok(())
    }

    fn update_if_outdated(&self, path: &Path) -> Result<()> {
        if !self.routable(path) {
            return Ok(());
        }
        if let Some(archive) = self.archive_for(path) {
            if archive.is_outdated(path)? {
                archive.add_or_update_file(path)?;
            }
        }
        Ok(())
    }

    fn delete_vanished(&self, source_files: &[PathBuf]) {
        // archives report absolutized paths, so compare against the same
        let live: HashSet<PathBuf> = source_files
            .iter()
            .filter_map(|p| std::path::absolute(p).ok())
            .collect();
        // each archive drops its own stale entries; extension routing may
        // have changed since the file was archived
        for archive in &self.archives {
            for archived in archive.files() {
                if !live.contains(&archived) {
                    debug!(
                        "removing archived file missing from source: {}",
                        archived.display()
                    );
                    if let Err(e) = archive.delete_file(&archived) {
                        warn!("failed to remove {}: {e}", archived.display());
                    }
                }
            }
        }
    }

    /// Announce the stop, then drain and save every archive and drop all
    /// subscribers.
    pub fn stop(&self) -> Result<()> {
        info!("stopping file monitor");
        self.monitoring_stopped.emit(&());
        let mut first_error = None;
        for archive in &self.archives {
            if let Err(e) = archive.shutdown() {
                warn!("archive shutdown failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        self.file_changed.clear();
        self.startup_completed.clear();
        self.monitoring_stopped.clear();
        self.ready.clear_subscribers();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
