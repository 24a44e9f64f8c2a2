//! Polling monitor over an explicit list of directories.
//!
//! The monitor owns a list of top-level directories, enumerates their
//! contents on a fixed interval, and pushes anything outdated through the
//! [`FileMonitor`]. Scans never overlap: a single gate admits one scan at
//! a time, and list mutations wait for the in-flight scan to finish so a
//! scan never observes a half-edited directory list.

use crate::monitor::{FileMonitor, FileSource};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use srcmirror_core::config::ScanConfig;
use srcmirror_core::error::{MirrorError, Result};
use srcmirror_core::events::{Subscribers, Subscription};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Directory names that are never scanned, compared case-insensitively.
const EXCLUDED_DIR_NAMES: &[&str] = &["bin", "obj", "TestResults"];

/// Leading characters that mark editor droppings and hidden files.
const EXCLUDED_PREFIXES: &[char] = &['#', '~', '.'];

static BACKUP_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^backup\d*$").expect("valid backup pattern"));

const IDLE: u8 = 0;
const SCANNING: u8 = 1;
const STOPPED: u8 = 2;

/// One-at-a-time admission for scans and list edits.
struct ScanGate {
    state: AtomicU8,
}

impl ScanGate {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Non-blocking: claim the gate if idle. The timer uses this so a slow
    /// scan causes ticks to be skipped rather than queued.
    fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(IDLE, SCANNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Blocking: claim the gate, waiting out any in-flight scan. Returns
    /// `false` once the gate has been stopped.
    fn acquire(&self) -> bool {
        loop {
            match self
                .state
                .compare_exchange(IDLE, SCANNING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(STOPPED) => return false,
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn release(&self) {
        let _ = self
            .state
            .compare_exchange(SCANNING, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stop admitting work, waiting for an in-flight scan to drain first.
    fn stop(&self) {
        loop {
            match self
                .state
                .compare_exchange(IDLE, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) | Err(STOPPED) => return,
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

/// Walks one directory tree, excluding build output, backup directories,
/// and prefixed files.
pub fn enumerate_directory(directory: &Path) -> Vec<PathBuf> {
    let walker = ignore::WalkBuilder::new(directory)
        .standard_filters(false)
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if name
                .chars()
                .next()
                .is_some_and(|c| EXCLUDED_PREFIXES.contains(&c))
            {
                return false;
            }
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            if is_dir
                && (EXCLUDED_DIR_NAMES
                    .iter()
                    .any(|excluded| name.eq_ignore_ascii_case(excluded))
                    || BACKUP_DIR_RE.is_match(&name))
            {
                return false;
            }
            true
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_some_and(|t| t.is_file()) {
                    files.push(entry.into_path());
                }
            }
            Err(e) => warn!("skipping unreadable entry under {}: {e}", directory.display()),
        }
    }
    files
}

/// Periodically rescans a set of directories and mirrors their contents.
pub struct DirectoryScanningMonitor {
    monitor: Arc<FileMonitor>,
    config: ScanConfig,
    directories: Mutex<Vec<PathBuf>>,
    gate: Arc<ScanGate>,
    list_path: PathBuf,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    directory_added: Subscribers<PathBuf>,
    directory_removed: Subscribers<PathBuf>,
}

impl DirectoryScanningMonitor {
    pub fn new(monitor: Arc<FileMonitor>, config: ScanConfig) -> Self {
        let list_path = monitor.storage().monitor_list_path();
        Self {
            monitor,
            config,
            directories: Mutex::new(Vec::new()),
            gate: Arc::new(ScanGate::new()),
            list_path,
            scan_task: Mutex::new(None),
            directory_added: Subscribers::new(),
            directory_removed: Subscribers::new(),
        }
    }

    pub fn monitor(&self) -> &Arc<FileMonitor> {
        &self.monitor
    }

    pub fn monitored_directories(&self) -> Vec<PathBuf> {
        self.directories.lock().clone()
    }

    /// Whether `path` falls under any monitored directory.
    pub fn is_monitoring(&self, path: &Path) -> bool {
        let Ok(path) = std::path::absolute(path) else {
            return false;
        };
        self.directories
            .lock()
            .iter()
            .any(|dir| path.starts_with(dir))
    }

    pub fn on_directory_added(
        &self,
        callback: impl Fn(&PathBuf) + Send + Sync + 'static,
    ) -> Subscription {
        self.directory_added.subscribe(callback)
    }

    pub fn on_directory_removed(
        &self,
        callback: impl Fn(&PathBuf) + Send + Sync + 'static,
    ) -> Subscription {
        self.directory_removed.subscribe(callback)
    }

    fn check_directory_allowed(&self, directory: &Path) -> Result<()> {
        if directory.parent().is_none() {
            return Err(MirrorError::ForbiddenDirectory {
                path: directory.to_path_buf(),
                reason: "cannot monitor a filesystem root".to_string(),
            });
        }
        let storage = self.monitor.storage();
        if storage.contains(directory) || storage.root().starts_with(directory) {
            return Err(MirrorError::ForbiddenDirectory {
                path: directory.to_path_buf(),
                reason: "directory overlaps the mirror's own storage".to_string(),
            });
        }
        Ok(())
    }

    /// Add a top-level directory to the monitored set.
    ///
    /// Re-adding an already monitored directory is a no-op. A directory
    /// nested inside (or enclosing) a monitored one is rejected with
    /// [`MirrorError::NestedDirectory`]. When monitoring is running, the
    /// new directory's files are mirrored immediately.
    pub fn add_directory(&self, directory: &Path) -> Result<()> {
        let directory = std::path::absolute(directory)?;
        if !directory.is_dir() {
            return Err(MirrorError::monitor(format!(
                "not a directory: {}",
                directory.display()
            )));
        }
        self.check_directory_allowed(&directory)?;

        if !self.gate.acquire() {
            return Err(MirrorError::monitor("monitor is stopped"));
        }
        match self.try_insert(&directory) {
            Ok(true) => {}
            Ok(false) => {
                self.gate.release();
                return Ok(());
            }
            Err(e) => {
                self.gate.release();
                return Err(e);
            }
        }
        if self.is_running() {
            self.mirror_directory(&directory);
        }
        self.gate.release();

        info!("monitoring directory {}", directory.display());
        self.directory_added.emit(&directory);
        Ok(())
    }

    /// Nesting check and insert under one lock, so two racing adds cannot
    /// both pass the check. Returns `Ok(false)` when already monitored.
    fn try_insert(&self, directory: &Path) -> Result<bool> {
        let mut directories = self.directories.lock();
        for known in directories.iter() {
            if *known == directory {
                return Ok(false);
            }
            if directory.starts_with(known) {
                return Err(MirrorError::NestedDirectory {
                    path: directory.to_path_buf(),
                    parent: known.clone(),
                });
            }
            if known.starts_with(directory) {
                return Err(MirrorError::NestedDirectory {
                    path: known.clone(),
                    parent: directory.to_path_buf(),
                });
            }
        }
        directories.push(directory.to_path_buf());
        Ok(true)
    }

    /// Remove a directory and delete its files from the archives. Removing
    /// an unmonitored directory is a no-op.
    pub fn remove_directory(&self, directory: &Path) -> Result<()> {
        let directory = std::path::absolute(directory)?;

        if !self.gate.acquire() {
            return Err(MirrorError::monitor("monitor is stopped"));
        }
        let removed = {
            let mut directories = self.directories.lock();
            let before = directories.len();
            directories.retain(|known| *known != directory);
            directories.len() != before
        };
        if removed {
            for archived in self.monitor.archived_files() {
                if archived.starts_with(&directory) {
                    if let Err(e) = self.monitor.delete_file(&archived) {
                        warn!("failed to drop {}: {e}", archived.display());
                    }
                }
            }
        }
        self.gate.release();

        if removed {
            info!("stopped monitoring directory {}", directory.display());
            self.directory_removed.emit(&directory);
        }
        Ok(())
    }

    fn mirror_directory(&self, directory: &Path) {
        for file in enumerate_directory(directory) {
            if let Err(e) = self.monitor.add_or_update_file(&file) {
                warn!("failed to mirror {}: {e}", file.display());
            }
        }
    }

    /// Reconcile the archives against the monitored directories once.
    pub fn startup(&self) -> Result<()> {
        if !self.gate.acquire() {
            return Err(MirrorError::monitor("monitor is stopped"));
        }
        let result = self
            .monitor
            .startup_concurrent(&self.files(), &self.config);
        self.gate.release();
        result
    }

    /// Start the periodic scan loop on the current tokio runtime. Starting
    /// twice is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut task = self.scan_task.lock();
        if task.is_some() {
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(this.config.interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if !this.gate.try_begin() {
                    debug!("previous scan still running, skipping tick");
                    continue;
                }
                let scanner = Arc::clone(&this);
                // the gate is released inside the blocking closure so an
                // aborted timer task cannot leave it claimed
                let scan = tokio::task::spawn_blocking(move || {
                    if let Err(e) = scanner.monitor.reconcile(&scanner.files()) {
                        warn!("directory scan failed: {e}");
                    }
                    scanner.gate.release();
                });
                if scan.await.is_err() {
                    warn!("scan task panicked");
                }
            }
        }));
    }

    fn is_running(&self) -> bool {
        self.scan_task.lock().is_some()
    }

    /// Stop scanning, persist the directory list, and shut the archives
    /// down.
    pub fn stop_monitoring(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        self.gate.stop();
        if let Err(e) = self.save_directory_list() {
            warn!("failed to save monitored directory list: {e}");
        }
        self.monitor.stop()
    }

    /// Write the monitored directory list, one absolute path per line.
    pub fn save_directory_list(&self) -> Result<()> {
        if let Some(parent) = self.list_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let directories = self.directories.lock().clone();
        let dir = self.list_path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for directory in &directories {
            writeln!(tmp, "{}", directory.display())?;
        }
        tmp.persist(&self.list_path)
            .map_err(|e| MirrorError::Io(e.error))?;
        Ok(())
    }

    /// Re-add the directories recorded by a previous run. Directories that
    /// no longer exist or are no longer allowed are skipped with a warning.
    pub fn add_directories_from_save_file(&self) -> Result<()> {
        if !self.list_path.exists() {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.list_path)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.add_directory(Path::new(line)) {
                warn!("skipping saved directory {line}: {e}");
            }
        }
        Ok(())
    }
}

impl FileSource for DirectoryScanningMonitor {
    /// Every file under every monitored directory, exclusions applied.
    fn files(&self) -> Vec<PathBuf> {
        let directories = self.directories.lock().clone();
        let mut files = Vec::new();
        for directory in &directories {
            files.extend(enumerate_directory(directory));
        }
        files
    }
}
