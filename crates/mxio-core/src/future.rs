//! One-shot cancelable completion future
//!
//! The cross-thread publish point between a worker loop and whoever
//! requested an operation. Exactly one of complete/fail/cancel settles
//! the future; later settle attempts return false and change nothing.
//!
//! Failure payloads are `Arc<ReactorError>` so that coalesced waiters
//! (e.g. every requester queued on one endpoint in the session pool)
//! can share a single cause.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ReactorError;

/// Outcome carried by a settled future.
pub type Settled<T> = Result<T, Arc<ReactorError>>;

type Callback<T> = Box<dyn FnOnce(&Settled<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        callbacks: Vec<Callback<T>>,
        cancel_hooks: Vec<CancelHook>,
    },
    Settled(Settled<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A cancelable one-shot future.
///
/// Cheap to clone; all clones observe the same settlement.
pub struct IoFuture<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        IoFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for IoFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IoFuture<T> {
    pub fn new() -> Self {
        IoFuture {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    callbacks: Vec::new(),
                    cancel_hooks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// An already-successful future.
    pub fn completed(value: T) -> Self {
        let f = Self::new();
        f.complete(value);
        f
    }

    /// An already-failed future.
    pub fn failed(err: ReactorError) -> Self {
        let f = Self::new();
        f.fail(err);
        f
    }

    /// Settle with a value. Returns false if already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value), false)
    }

    /// Settle with an error. Returns false if already settled.
    pub fn fail(&self, err: ReactorError) -> bool {
        self.settle(Err(Arc::new(err)), false)
    }

    /// Settle with a shared error. Returns false if already settled.
    pub fn fail_shared(&self, err: Arc<ReactorError>) -> bool {
        self.settle(Err(err), false)
    }

    /// Cancel: settles with [`ReactorError::Cancelled`] and runs any
    /// registered cancel hooks (which typically wake the owning worker
    /// so it can abort the in-flight operation). Returns false if the
    /// future had already settled.
    pub fn cancel(&self) -> bool {
        self.settle(Err(Arc::new(ReactorError::Cancelled)), true)
    }

    /// Register a completion callback. Runs at settle time on whichever
    /// thread settles the future; runs immediately if already settled.
    pub fn on_complete(&self, cb: impl FnOnce(&Settled<T>) + Send + 'static) {
        let mut guard = self.inner.state.lock();
        match &mut *guard {
            State::Pending { callbacks, .. } => callbacks.push(Box::new(cb)),
            State::Settled(result) => {
                let result = result.clone();
                drop(guard);
                cb(&result);
            }
        }
    }

    /// Register a cancel hook. Dropped unused if the future settles any
    /// other way, or if it was already settled when the hook arrived.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut guard = self.inner.state.lock();
        if let State::Pending { cancel_hooks, .. } = &mut *guard {
            cancel_hooks.push(Box::new(hook));
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Settled(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            &*self.inner.state.lock(),
            State::Settled(Err(e)) if matches!(**e, ReactorError::Cancelled)
        )
    }

    /// Non-blocking peek at the outcome.
    pub fn try_result(&self) -> Option<Settled<T>> {
        match &*self.inner.state.lock() {
            State::Settled(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Block until settled.
    pub fn wait(&self) -> Settled<T> {
        let mut guard = self.inner.state.lock();
        loop {
            if let State::Settled(result) = &*guard {
                return result.clone();
            }
            self.inner.cond.wait(&mut guard);
        }
    }

    /// Block until settled or the timeout elapses. `None` means the
    /// future is still pending.
    pub fn wait_for(&self, timeout: Duration) -> Option<Settled<T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock();
        loop {
            if let State::Settled(result) = &*guard {
                return Some(result.clone());
            }
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                return match &*guard {
                    State::Settled(result) => Some(result.clone()),
                    State::Pending { .. } => None,
                };
            }
        }
    }

    fn settle(&self, value: Settled<T>, run_cancel_hooks: bool) -> bool {
        let mut guard = self.inner.state.lock();
        if matches!(&*guard, State::Settled(_)) {
            return false;
        }
        let prev = std::mem::replace(&mut *guard, State::Settled(value.clone()));
        drop(guard);
        self.inner.cond.notify_all();

        // Callbacks and hooks run outside the lock; they may touch the
        // future again.
        if let State::Pending {
            callbacks,
            cancel_hooks,
        } = prev
        {
            if run_cancel_hooks {
                for hook in cancel_hooks {
                    hook();
                }
            }
            for cb in callbacks {
                cb(&value);
            }
        }
        true
    }
}
