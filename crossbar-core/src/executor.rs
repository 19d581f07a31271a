//! Deferred and periodic execution
//!
//! [`Executor`] is the seam between components that need timers (request
//! timeouts, batch flushing) and the thread that runs them. Two
//! implementations exist: [`DelayedExecutor`] (dedicated worker thread,
//! here) and the bus event loop itself (`TcpBus`), which runs due actions
//! between poll rounds.
//!
//! Actions run sequentially on the backing thread; a long-running action
//! delays all subsequent ones, so callers must not block.

use crate::action_map::{Action, ActionMap};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::trace;

/// Something that can run a nullary action at (or after) a deadline.
pub trait Executor: Send + Sync {
    /// Run `action` once `deadline` has passed.
    fn schedule_at(&self, action: Action, deadline: Instant);

    /// Run `action` once `delay` has elapsed.
    fn schedule(&self, action: Action, delay: Duration) {
        self.schedule_at(action, Instant::now() + delay);
    }
}

struct WorkerShared {
    actions: Mutex<ActionMap>,
    wake: Condvar,
    shut_down: AtomicBool,
}

/// A single worker thread draining a deadline-ordered action queue.
///
/// The worker executes every action whose deadline has passed (outside the
/// internal lock), then sleeps until the next deadline or an explicit wake.
/// Dropping the executor wakes and joins the worker; actions still queued
/// at that point are abandoned.
pub struct DelayedExecutor {
    shared: Arc<WorkerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedExecutor {
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            actions: Mutex::new(ActionMap::new()),
            wake: Condvar::new(),
            shut_down: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("crossbar-timer".into())
            .spawn(move || Self::run(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(shared: &WorkerShared) {
        loop {
            // Drain everything due, executing outside the lock.
            loop {
                let action = {
                    let mut actions = shared.actions.lock();
                    match actions.next_time_point() {
                        Some(at) if at <= Instant::now() => actions.pick_action(),
                        _ => None,
                    }
                };
                match action {
                    Some(action) => action(),
                    None => break,
                }
            }

            let mut actions = shared.actions.lock();
            if shared.shut_down.load(Ordering::Acquire) {
                break;
            }
            match actions.next_time_point() {
                Some(at) => {
                    let _ = shared.wake.wait_until(&mut actions, at);
                }
                None => shared.wake.wait(&mut actions),
            }
        }
    }
}

impl Executor for DelayedExecutor {
    fn schedule_at(&self, action: Action, deadline: Instant) {
        if self.shared.shut_down.load(Ordering::Acquire) {
            trace!("action scheduled after shutdown; dropped");
            return;
        }
        self.shared.actions.lock().insert(deadline, action);
        self.shared.wake.notify_one();
    }
}

impl Drop for DelayedExecutor {
    fn drop(&mut self) {
        self.shared.shut_down.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

struct PeriodicInner {
    action: Box<dyn Fn() + Send + Sync>,
    period: Duration,
    backend: Arc<dyn Executor>,
}

/// Re-arms a nullary action at a fixed period on a backing executor.
///
/// The next invocation is armed before the action runs, so on a
/// single-threaded backend at most one invocation is outstanding at a time.
pub struct PeriodicExecutor {
    inner: Arc<PeriodicInner>,
}

impl PeriodicExecutor {
    pub fn new(
        action: impl Fn() + Send + Sync + 'static,
        period: Duration,
        backend: Arc<dyn Executor>,
    ) -> Self {
        Self {
            inner: Arc::new(PeriodicInner {
                action: Box::new(action),
                period,
                backend,
            }),
        }
    }

    /// Fire immediately, then every period.
    pub fn start(&self) {
        Self::arm(&self.inner, Duration::ZERO);
    }

    /// Wait one period, then fire every period.
    pub fn delayed_start(&self) {
        Self::arm(&self.inner, self.inner.period);
    }

    /// Run the action once, out of band, without re-arming.
    pub fn trigger(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .backend
            .schedule(Box::new(move || (inner.action)()), Duration::ZERO);
    }

    fn arm(inner: &Arc<PeriodicInner>, delay: Duration) {
        let next = Arc::clone(inner);
        inner
            .backend
            .schedule(Box::new(move || Self::fire(&next)), delay);
    }

    fn fire(inner: &Arc<PeriodicInner>) {
        Self::arm(inner, inner.period);
        (inner.action)();
    }
}
