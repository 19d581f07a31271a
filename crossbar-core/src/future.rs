//! One-shot value delivery
//!
//! [`Promise`] / [`Future`] carry a single value from whoever produces it
//! (the event loop, a timeout action) to any number of subscribers. The
//! shared state is refcounted; the promise keeps it alive until
//! `set_value` has delivered to every subscriber registered so far.
//!
//! Subscribers registered after completion run inline on the caller's
//! thread. Each subscription runs exactly once.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Ready(T),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// The writing end: delivers the value at most once.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// The reading end: subscribe, block, or compose.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Deliver the value. The first call wins; later calls are no-ops.
    pub fn set_value(&self, value: T) {
        let callbacks = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Ready(_) => {
                    debug!("promise already resolved; value dropped");
                    return;
                }
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Ready(value.clone());
                    callbacks
                }
            }
        };
        self.shared.ready.notify_all();
        for callback in callbacks {
            callback(value.clone());
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Run `callback` when the value arrives; inline if already there.
    ///
    /// The callback must not block: it may run on the event-loop or timer
    /// thread.
    pub fn subscribe(&self, callback: impl FnOnce(T) + Send + 'static) {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Ready(value) => {
                let value = value.clone();
                drop(state);
                callback(value);
            }
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
        }
    }

    /// Block the calling thread until the value arrives.
    #[must_use]
    pub fn wait(&self) -> T {
        let mut state = self.shared.state.lock();
        loop {
            if let State::Ready(value) = &*state {
                return value.clone();
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Block until the value arrives or `timeout` elapses.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let State::Ready(value) = &*state {
                return Some(value.clone());
            }
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                if let State::Ready(value) = &*state {
                    return Some(value.clone());
                }
                return None;
            }
        }
    }

    /// A future holding `f` applied to this future's value.
    #[must_use]
    pub fn map<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Future<U> {
        let promise = Promise::new();
        let mapped = promise.future();
        self.subscribe(move |value| promise.set_value(f(value)));
        mapped
    }
}

/// A future that is already complete.
#[must_use]
pub fn ready<T: Clone + Send + 'static>(value: T) -> Future<T> {
    let promise = Promise::new();
    promise.set_value(value);
    promise.future()
}

/// Single-shot notification between threads.
///
/// Used by tests and shutdown paths that need a process-wide completion
/// signal without any bus-level state.
#[derive(Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        drop(flag);
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }

    /// Returns `false` when `timeout` elapsed before a notify.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
        true
    }

    pub fn reset(&self) {
        *self.flag.lock() = false;
    }
}
