//! Archive host and the storage capability trait.
//!
//! An [`Archive`] pairs a storage backend with a [`TaskManager`] and a
//! change-event registry. The backend only implements the storage
//! primitives; ordering, event emission, and rename fallback live here so
//! every backend gets identical observable behavior.

use crate::task_manager::TaskManager;
use srcmirror_core::error::Result;
use srcmirror_core::events::{FileEvent, FileEventKind, Subscribers, Subscription};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Storage primitives for one archive backend.
///
/// Implementations are called with the task manager already serializing
/// access, so they do not need their own cross-call ordering.
pub trait ArchiveStore: Send + Sync {
    /// Source-file extensions this backend accepts, lowercase with leading
    /// dots, e.g. `".c"`.
    fn supported_extensions(&self) -> &[String];

    /// Whether `source_path` has an entry in the archive.
    fn contains(&self, source_path: &Path) -> bool;

    /// Whether the archived state of `source_path` no longer matches the
    /// file on disk.
    fn is_outdated(&self, source_path: &Path) -> Result<bool>;

    /// Source paths of every archived file.
    fn files(&self) -> Vec<PathBuf>;

    /// Add or refresh the entry for `source_path`. Returns the event kind
    /// to emit, or `None` if nothing changed.
    fn add_or_update_impl(&self, source_path: &Path) -> Result<Option<FileEventKind>>;

    /// Remove the entry for `source_path`. Returns `false` if there was
    /// nothing to remove.
    fn delete_impl(&self, source_path: &Path) -> Result<bool>;

    /// Move the entry from `old_path` to `new_path`. Only called when
    /// `old_path` is archived. Returns `false` if no entry resulted.
    fn rename_impl(&self, old_path: &Path, new_path: &Path) -> Result<bool>;

    /// Flush any persistent state to disk.
    fn save(&self) -> Result<()>;
}

fn add_or_update(
    store: &dyn ArchiveStore,
    events: &Subscribers<FileEvent>,
    path: &Path,
) -> Result<()> {
    if let Some(kind) = store.add_or_update_impl(path)? {
        events.emit(&FileEvent::with_kind(kind, path.to_path_buf()));
    }
    Ok(())
}

fn delete(store: &dyn ArchiveStore, events: &Subscribers<FileEvent>, path: &Path) -> Result<()> {
    if store.delete_impl(path)? {
        events.emit(&FileEvent::deleted(path.to_path_buf()));
    }
    Ok(())
}

fn rename(
    store: &dyn ArchiveStore,
    events: &Subscribers<FileEvent>,
    old_path: &Path,
    new_path: &Path,
) -> Result<()> {
    if store.contains(old_path) {
        if store.rename_impl(old_path, new_path)? {
            events.emit(&FileEvent::renamed(
                old_path.to_path_buf(),
                new_path.to_path_buf(),
            ));
        }
        Ok(())
    } else {
        // unseen old path: treat the rename as an add of the new path
        add_or_update(store, events, new_path)
    }
}

/// A storage backend hosted behind ordered task execution.
pub struct Archive {
    store: Arc<dyn ArchiveStore>,
    tasks: TaskManager,
    file_changed: Subscribers<FileEvent>,
}

impl Archive {
    /// Host `store` on the current tokio runtime.
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self::with_tasks(store, TaskManager::new())
    }

    pub fn with_tasks(store: Arc<dyn ArchiveStore>, tasks: TaskManager) -> Self {
        Self {
            store,
            tasks,
            file_changed: Subscribers::new(),
        }
    }

    pub fn supported_extensions(&self) -> &[String] {
        self.store.supported_extensions()
    }

    pub fn contains(&self, source_path: &Path) -> bool {
        self.store.contains(source_path)
    }

    pub fn is_outdated(&self, source_path: &Path) -> Result<bool> {
        self.store.is_outdated(source_path)
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.store.files()
    }

    pub fn is_ready(&self) -> bool {
        self.tasks.is_ready()
    }

    pub fn on_ready_changed(
        &self,
        callback: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.tasks.on_ready_changed(callback)
    }

    /// Subscribe to archive mutations. Events fire after the mutation has
    /// completed, in task order.
    pub fn on_file_changed(
        &self,
        callback: impl Fn(&FileEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.file_changed.subscribe(callback)
    }

    /// Add or refresh `source_path`, blocking until done.
    pub fn add_or_update_file(&self, source_path: &Path) -> Result<()> {
        let path = source_path.to_path_buf();
        self.tasks
            .run(|| add_or_update(self.store.as_ref(), &self.file_changed, &path))
    }

    pub fn delete_file(&self, source_path: &Path) -> Result<()> {
        let path = source_path.to_path_buf();
        self.tasks
            .run(|| delete(self.store.as_ref(), &self.file_changed, &path))
    }

    pub fn rename_file(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        let (old, new) = (old_path.to_path_buf(), new_path.to_path_buf());
        self.tasks
            .run(|| rename(self.store.as_ref(), &self.file_changed, &old, &new))
    }

    /// Queue an add-or-update on the blocking pool, preserving submission
    /// order relative to other queued mutations.
    pub fn add_or_update_file_async(&self, source_path: &Path) -> JoinHandle<Result<()>> {
        let store = Arc::clone(&self.store);
        let events = self.file_changed.clone();
        let path = source_path.to_path_buf();
        self.tasks
            .run_async(move || add_or_update(store.as_ref(), &events, &path))
    }

    pub fn delete_file_async(&self, source_path: &Path) -> JoinHandle<Result<()>> {
        let store = Arc::clone(&self.store);
        let events = self.file_changed.clone();
        let path = source_path.to_path_buf();
        self.tasks
            .run_async(move || delete(store.as_ref(), &events, &path))
    }

    pub fn rename_file_async(&self, old_path: &Path, new_path: &Path) -> JoinHandle<Result<()>> {
        let store = Arc::clone(&self.store);
        let events = self.file_changed.clone();
        let (old, new) = (old_path.to_path_buf(), new_path.to_path_buf());
        self.tasks
            .run_async(move || rename(store.as_ref(), &events, &old, &new))
    }

    /// Wait for outstanding tasks, flush state, and drop all subscribers.
    pub fn shutdown(&self) -> Result<()> {
        self.tasks.drain();
        let result = self.store.save();
        self.file_changed.clear();
        result
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if let Err(e) = self.store.save() {
            warn!("failed to save archive state on drop: {e}");
        }
    }
}
