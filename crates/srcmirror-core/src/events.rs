//! File events and the observer registry that carries them.
//!
//! Archives and monitors publish events through explicit [`Subscribers`]
//! registries instead of language-level event machinery. A subscriber holds
//! the returned [`Subscription`] for as long as it wants callbacks; dropping
//! it unsubscribes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// The kind of change an archive observed for one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileEventKind {
    Added,
    Changed,
    Deleted,
    Renamed,
}

/// A change to one monitored source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    /// Previous path, present only for [`FileEventKind::Renamed`].
    pub old_path: Option<PathBuf>,
}

impl FileEvent {
    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::Added,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::Changed,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::Deleted,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn renamed(old_path: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::Renamed,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }

    pub fn with_kind(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            old_path: None,
        }
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Registry<T> = Mutex<HashMap<u64, Callback<T>>>;

/// An explicit observer list.
///
/// Cloning shares the registry, so a publisher can hand out emit-capable
/// clones to background tasks.
pub struct Subscribers<T> {
    callbacks: Arc<Registry<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            callbacks: Arc::clone(&self.callbacks),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a callback. The callback is dropped when the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, Arc::new(callback));

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.callbacks);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(callbacks) = weak.upgrade() {
                    callbacks.lock().remove(&id);
                }
            })),
        }
    }

    /// Invoke every registered callback with `value`.
    ///
    /// Callbacks run outside the registry lock, so a callback may subscribe
    /// or unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self.callbacks.lock().values().cloned().collect();
        for callback in snapshot {
            callback(value);
        }
    }

    /// Drop every registered callback.
    pub fn clear(&self) {
        self.callbacks.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

/// Guard for one registered callback; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Leave the callback registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Edge-triggered readiness state.
///
/// Subscribers are notified exactly once per transition; setting the same
/// value twice fires nothing. Callbacks run under the state lock so edges
/// are observed in order; they must not call back into [`ReadyNotifier::set`].
pub struct ReadyNotifier {
    state: Mutex<bool>,
    subscribers: Subscribers<bool>,
}

impl Default for ReadyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyNotifier {
    /// Create a notifier that starts out ready.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(true),
            subscribers: Subscribers::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock()
    }

    /// Update the state, notifying subscribers only on a change.
    pub fn set(&self, ready: bool) {
        let mut state = self.state.lock();
        if *state != ready {
            *state = ready;
            self.subscribers.emit(&ready);
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(callback)
    }

    pub fn clear_subscribers(&self) {
        self.subscribers.clear();
    }
}
