//! File system event monitor with debouncing and change coalescing.
//!
//! Raw notify events are coalesced per path, debounced, and emitted in
//! batches; each batch is routed through the [`FileMonitor`] on the
//! blocking pool. Editors produce bursts of create/modify/delete noise
//! for one save, so coalescing keeps the archives from regenerating the
//! same artifact several times per keystroke.

use crate::monitor::FileMonitor;
use dashmap::DashMap;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use srcmirror_core::error::{MirrorError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Raw change observed on the watched tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatchEvent {
    fn path(&self) -> &PathBuf {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) => p,
            WatchEvent::Renamed { to, .. } => to,
        }
    }
}

/// Configuration for the event monitor.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Wait this long after the last event for a path before emitting it.
    pub debounce_duration: Duration,

    /// Emit batched events at this interval.
    pub batch_interval: Duration,

    /// Maximum pending events before forcing emission.
    pub max_batch_size: usize,

    /// Whether to merge multiple events for the same path.
    pub coalesce_events: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_duration: Duration::from_millis(100),
            batch_interval: Duration::from_millis(500),
            max_batch_size: 100,
            coalesce_events: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEvent {
    event: WatchEvent,
    last_updated: Instant,
}

/// Watches one directory tree and routes debounced changes into a
/// [`FileMonitor`].
pub struct FsEventMonitor {
    _watcher: RecommendedWatcher,
    coalescer: JoinHandle<()>,
    ticker: JoinHandle<()>,
    router: JoinHandle<()>,
    watched_path: PathBuf,
}

impl FsEventMonitor {
    pub fn new(path: &Path, monitor: Arc<FileMonitor>) -> Result<Self> {
        Self::with_config(path, monitor, WatchConfig::default())
    }

    pub fn with_config(
        path: &Path,
        monitor: Arc<FileMonitor>,
        config: WatchConfig,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<Vec<WatchEvent>>();

        let tx_clone = raw_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if let Some(watch_event) = convert_event(event) {
                    let _ = tx_clone.send(watch_event);
                }
            }
        })
        .map_err(|e| MirrorError::monitor(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| MirrorError::monitor(format!("failed to watch path: {e}")))?;

        info!("event monitor started for {}", path.display());

        let (coalescer, ticker) = spawn_coalescer(raw_rx, batch_tx, config);

        let router = tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let monitor = Arc::clone(&monitor);
                let routed = tokio::task::spawn_blocking(move || {
                    for event in batch {
                        if let Err(e) = route_event(&monitor, &event) {
                            warn!("failed to route {:?}: {e}", event);
                        }
                    }
                })
                .await;
                if routed.is_err() {
                    warn!("event routing task panicked");
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            coalescer,
            ticker,
            router,
            watched_path: path.to_path_buf(),
        })
    }

    pub fn watched_path(&self) -> &Path {
        &self.watched_path
    }

    /// Stop watching. In-flight batches are dropped.
    pub fn stop(&self) {
        self.coalescer.abort();
        self.ticker.abort();
        self.router.abort();
    }
}

impl Drop for FsEventMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route_event(monitor: &FileMonitor, event: &WatchEvent) -> Result<()> {
    match event {
        WatchEvent::Created(path) | WatchEvent::Modified(path) => {
            monitor.add_or_update_file(path)
        }
        WatchEvent::Deleted(path) => monitor.delete_file(path),
        WatchEvent::Renamed { from, to } => monitor.rename_file(from, to),
    }
}

/// Spawn the intake task (coalescing raw events per path) and the ticker
/// task (emitting debounced batches). Both handles go back to the caller
/// so `stop` can abort them.
fn spawn_coalescer(
    mut raw_rx: mpsc::UnboundedReceiver<WatchEvent>,
    batch_tx: mpsc::UnboundedSender<Vec<WatchEvent>>,
    config: WatchConfig,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let pending: Arc<DashMap<PathBuf, PendingEvent>> = Arc::new(DashMap::new());
    let pending_clone = Arc::clone(&pending);
    let ticker_config = config.clone();

    let ticker = tokio::spawn(async move {
        let mut ticks = interval(ticker_config.batch_interval);
        loop {
            ticks.tick().await;

            let now = Instant::now();
            let mut to_emit = Vec::new();

            pending_clone.retain(|path, event| {
                if now.duration_since(event.last_updated) >= ticker_config.debounce_duration {
                    to_emit.push(event.event.clone());
                    debug!("emitting debounced event for {}", path.display());
                    false
                } else {
                    true
                }
            });

            if !to_emit.is_empty() && batch_tx.send(to_emit).is_err() {
                // receiver dropped, stop task
                break;
            }

            if pending_clone.len() >= ticker_config.max_batch_size {
                warn!("max batch size reached, forcing emission");
                let mut force_emit = Vec::new();
                pending_clone.retain(|_, event| {
                    force_emit.push(event.event.clone());
                    false
                });
                if !force_emit.is_empty() {
                    let _ = batch_tx.send(force_emit);
                }
            }
        }
    });

    let coalescer = tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            let path = event.path().clone();

            if config.coalesce_events {
                if let Some(mut existing) = pending.get_mut(&path) {
                    existing.event = merge_events(&existing.event, &event);
                    existing.last_updated = Instant::now();
                    debug!("coalesced event for {}", path.display());
                    continue;
                }
            }
            pending.insert(
                path,
                PendingEvent {
                    event,
                    last_updated: Instant::now(),
                },
            );
        }
    });

    (coalescer, ticker)
}

/// Merge two events observed for the same path.
fn merge_events(old: &WatchEvent, new: &WatchEvent) -> WatchEvent {
    match (old, new) {
        (WatchEvent::Modified(_), WatchEvent::Modified(p)) => WatchEvent::Modified(p.clone()),

        // created then modified: the file is still new to us
        (WatchEvent::Created(p), WatchEvent::Modified(_)) => WatchEvent::Created(p.clone()),

        (WatchEvent::Created(_), WatchEvent::Deleted(p)) => WatchEvent::Deleted(p.clone()),

        (WatchEvent::Modified(_), WatchEvent::Deleted(p)) => WatchEvent::Deleted(p.clone()),

        // deleted then recreated: contents may differ
        (WatchEvent::Deleted(_), WatchEvent::Created(p)) => WatchEvent::Modified(p.clone()),

        _ => new.clone(),
    }
}

/// Convert a notify event, dropping kinds the monitor does not act on.
fn convert_event(event: Event) -> Option<WatchEvent> {
    if event.paths.is_empty() {
        return None;
    }

    match event.kind {
        EventKind::Create(_) => Some(WatchEvent::Created(event.paths[0].clone())),
        EventKind::Remove(_) => Some(WatchEvent::Deleted(event.paths[0].clone())),
        EventKind::Modify(ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            Some(WatchEvent::Renamed {
                from: event.paths[0].clone(),
                to: event.paths[1].clone(),
            })
        }
        EventKind::Modify(_) => Some(WatchEvent::Modified(event.paths[0].clone())),
        EventKind::Any if event.paths.len() >= 2 => Some(WatchEvent::Renamed {
            from: event.paths[0].clone(),
            to: event.paths[1].clone(),
        }),
        _ => None,
    }
}
