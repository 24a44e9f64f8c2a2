//! Ordered background task execution with readiness tracking.
//!
//! Tasks take a ticket at submission time and execute strictly in ticket
//! order, so observers see archive mutations in the order they were
//! requested even when the work itself runs on a blocking pool. Readiness
//! flips to `false` when the outstanding count leaves zero and back to
//! `true` when it returns to zero; subscribers only hear about the edges.

use parking_lot::{Condvar, Mutex};
use srcmirror_core::error::Result;
use srcmirror_core::events::{ReadyNotifier, Subscription};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// FIFO admission gate. Tickets are issued at submission time; a task may
/// only run once every earlier ticket has finished.
struct TicketGate {
    next_ticket: AtomicU64,
    serving: Mutex<u64>,
    turn: Condvar,
}

impl TicketGate {
    fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            serving: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    fn take_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    fn wait_turn(&self, ticket: u64) {
        let mut serving = self.serving.lock();
        while *serving != ticket {
            self.turn.wait(&mut serving);
        }
    }

    fn advance(&self) {
        let mut serving = self.serving.lock();
        *serving += 1;
        self.turn.notify_all();
    }
}

struct Inner {
    gate: TicketGate,
    outstanding: AtomicUsize,
    ready: ReadyNotifier,
}

impl Inner {
    /// Register a task. Returns the ticket to wait on.
    fn begin(&self) -> u64 {
        if self.outstanding.fetch_add(1, Ordering::SeqCst) == 0 {
            self.ready.set(false);
        }
        self.gate.take_ticket()
    }

    fn finish(&self) {
        self.gate.advance();
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ready.set(true);
        }
    }
}

/// Releases the task slot when dropped, so a panicking task still advances
/// the gate instead of wedging every later ticket.
struct FinishGuard(Arc<Inner>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Runs archive mutations in submission order, synchronously on the caller
/// or asynchronously on the runtime's blocking pool.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
    handle: Handle,
}

impl TaskManager {
    /// Create a manager bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: TicketGate::new(),
                outstanding: AtomicUsize::new(0),
                ready: ReadyNotifier::new(),
            }),
            handle,
        }
    }

    /// `true` when no tasks are outstanding.
    pub fn is_ready(&self) -> bool {
        self.inner.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Subscribe to readiness edges. `true` fires when the last outstanding
    /// task completes, `false` when work starts from an idle state.
    pub fn on_ready_changed(
        &self,
        callback: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.ready.subscribe(callback)
    }

    /// Run `f` on the calling thread once its turn comes up.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let ticket = self.inner.begin();
        let guard = FinishGuard(Arc::clone(&self.inner));
        self.inner.gate.wait_turn(ticket);
        let out = f();
        drop(guard);
        out
    }

    /// Submit `f` to the blocking pool. The ticket is taken here, so tasks
    /// submitted back to back run in submission order regardless of how the
    /// pool schedules them.
    pub fn run_async(
        &self,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> JoinHandle<Result<()>> {
        let ticket = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        self.handle.spawn_blocking(move || {
            let guard = FinishGuard(inner.clone());
            inner.gate.wait_turn(ticket);
            let out = f();
            drop(guard);
            out
        })
    }

    /// Block until every outstanding task has completed.
    pub fn drain(&self) {
        while !self.is_ready() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_run_in_submission_order() {
        let manager = TaskManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let order = Arc::clone(&order);
            handles.push(manager.run_async(move || {
                order.lock().push(i);
                Ok(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ready_edges_fire_once_per_transition() {
        let manager = TaskManager::new();
        let busy_edges = Arc::new(AtomicU32::new(0));
        let idle_edges = Arc::new(AtomicU32::new(0));

        let busy = Arc::clone(&busy_edges);
        let idle = Arc::clone(&idle_edges);
        let _sub = manager.on_ready_changed(move |ready| {
            if *ready {
                idle.fetch_add(1, Ordering::SeqCst);
            } else {
                busy.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(manager.run_async(|| Ok(())));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        manager.drain();

        assert!(manager.is_ready());
        let busy = busy_edges.load(Ordering::SeqCst);
        let idle = idle_edges.load(Ordering::SeqCst);
        assert_eq!(busy, idle, "every busy edge pairs with an idle edge");
        assert!(busy >= 1);
        assert!(busy <= 8, "edges fire on transitions, not per task");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_run_returns_value() {
        let manager = TaskManager::new();
        assert_eq!(manager.run(|| 41 + 1), 42);
        assert!(manager.is_ready());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_waits_for_outstanding_work() {
        let manager = TaskManager::new();
        let done = Arc::new(AtomicU32::new(0));
        let done_in_task = Arc::clone(&done);
        let handle = manager.run_async(move || {
            std::thread::sleep(Duration::from_millis(50));
            done_in_task.store(1, Ordering::SeqCst);
            Ok(())
        });

        manager.drain();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        handle.await.unwrap().unwrap();
    }
}
