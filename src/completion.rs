//! Asynchronous completion primitive for lifecycle operations.
//!
//! Shutdown and flush may finish on a different thread than the one that
//! requested them. [`CompletionHandle`] is the settable handle both sides
//! share: the operation completes it exactly once, callers observe the
//! outcome by polling, blocking with a timeout, registering a callback, or
//! `.await`ing the handle. [`CompletionHandle::all_of`] joins many handles
//! into one that completes only after every child has completed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{DispatchError, DispatchResult};

type CompletionCallback = Box<dyn FnOnce(&DispatchResult) + Send>;

/// A clonable handle for the eventual success or failure of an operation.
///
/// A handle starts out pending and transitions to completed at most once;
/// later completion attempts are ignored. All clones observe the same
/// outcome.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    completed: Condvar,
}

#[derive(Default)]
struct State {
    outcome: Option<DispatchResult>,
    callbacks: Vec<CompletionCallback>,
    wakers: Vec<Waker>,
}

// The state behind the mutex is plain data, so a panic in another thread
// leaves it consistent and the poison flag can be cleared.
fn lock_state(shared: &Shared) -> MutexGuard<'_, State> {
    shared
        .state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CompletionHandle {
    /// Creates a pending handle.
    pub fn new() -> Self {
        CompletionHandle {
            inner: Arc::new(Shared {
                state: Mutex::new(State::default()),
                completed: Condvar::new(),
            }),
        }
    }

    /// Creates a handle that has already completed successfully.
    pub fn success() -> Self {
        let handle = Self::new();
        handle.succeed();
        handle
    }

    /// Creates a handle that has already completed with `error`.
    pub fn failure(error: DispatchError) -> Self {
        let handle = Self::new();
        handle.fail(error);
        handle
    }

    /// Completes the handle with `result`.
    ///
    /// Returns `true` if this call performed the completion, `false` if the
    /// handle was already complete. Registered callbacks run on the calling
    /// thread before this method returns.
    pub fn complete(&self, result: DispatchResult) -> bool {
        let outcome = result.clone();
        let (callbacks, wakers) = {
            let mut state = lock_state(&self.inner);
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result);
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.inner.completed.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Completes the handle successfully. See [`CompletionHandle::complete`].
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Completes the handle with `error`. See [`CompletionHandle::complete`].
    pub fn fail(&self, error: DispatchError) -> bool {
        self.complete(Err(error))
    }

    /// Returns `true` once the handle has completed, successfully or not.
    pub fn is_complete(&self) -> bool {
        lock_state(&self.inner).outcome.is_some()
    }

    /// Returns `true` if the handle completed successfully.
    ///
    /// A pending handle reports `false`.
    pub fn is_success(&self) -> bool {
        matches!(lock_state(&self.inner).outcome, Some(Ok(())))
    }

    /// Returns a clone of the outcome, or `None` while pending.
    pub fn result(&self) -> Option<DispatchResult> {
        lock_state(&self.inner).outcome.clone()
    }

    /// Registers `f` to run exactly once with the outcome.
    ///
    /// If the handle is already complete, `f` runs immediately on the calling
    /// thread; otherwise it runs on whichever thread performs the completion.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&DispatchResult) + Send + 'static,
    {
        let mut state = lock_state(&self.inner);
        match state.outcome.clone() {
            None => state.callbacks.push(Box::new(f)),
            Some(outcome) => {
                drop(state);
                f(&outcome);
            }
        }
    }

    /// Blocks the calling thread until the handle completes or `timeout`
    /// elapses.
    ///
    /// Returns the outcome, or [`DispatchError::Timeout`] if the handle is
    /// still pending when the deadline passes.
    pub fn wait(&self, timeout: Duration) -> DispatchResult {
        // A timeout the clock cannot represent degrades to an unbounded wait.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock_state(&self.inner);
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DispatchError::Timeout(timeout));
                    }
                    let (guard, _) = match self.inner.completed.wait_timeout(state, deadline - now)
                    {
                        Ok(woken) => woken,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    state = guard;
                }
                None => {
                    state = match self.inner.completed.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    /// Joins `handles` into one handle that completes only after every child
    /// has completed.
    ///
    /// The aggregate succeeds iff all children succeed; otherwise it fails
    /// with the first child failure observed (in completion order). An empty
    /// input yields an immediately successful handle.
    pub fn all_of<I>(handles: I) -> CompletionHandle
    where
        I: IntoIterator<Item = CompletionHandle>,
    {
        let handles: Vec<CompletionHandle> = handles.into_iter().collect();
        if handles.is_empty() {
            return CompletionHandle::success();
        }

        let aggregate = CompletionHandle::new();
        let remaining = Arc::new(AtomicUsize::new(handles.len()));
        let first_failure: Arc<Mutex<Option<DispatchError>>> = Arc::new(Mutex::new(None));

        for handle in handles {
            let aggregate = aggregate.clone();
            let remaining = Arc::clone(&remaining);
            let first_failure = Arc::clone(&first_failure);
            handle.on_complete(move |outcome| {
                if let Err(error) = outcome {
                    let mut slot = first_failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slot.get_or_insert_with(|| error.clone());
                }
                // The last child to complete settles the aggregate.
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let failure = first_failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .take();
                    match failure {
                        Some(error) => aggregate.fail(error),
                        None => aggregate.succeed(),
                    };
                }
            });
        }
        aggregate
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for CompletionHandle {
    type Output = DispatchResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock_state(&self.inner);
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_state(&self.inner);
        match &state.outcome {
            None => f.write_str("CompletionHandle(pending)"),
            Some(Ok(())) => f.write_str("CompletionHandle(success)"),
            Some(Err(error)) => write!(f, "CompletionHandle(failure: {error})"),
        }
    }
}
