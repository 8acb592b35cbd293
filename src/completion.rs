use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::timekeeper::{Shared, TimerKey};

/// How a timer was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The deadline passed and the worker fired the timer
    Elapsed,
    /// The timer was cancelled before it fired
    Cancelled,
    /// The service stopped while the timer was still pending
    Stopped,
}

impl Outcome {
    pub fn is_elapsed(self) -> bool {
        self == Outcome::Elapsed
    }

    pub fn is_cancelled(self) -> bool {
        self == Outcome::Cancelled
    }

    pub fn is_stopped(self) -> bool {
        self == Outcome::Stopped
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Elapsed => "elapsed",
            Outcome::Cancelled => "cancelled",
            Outcome::Stopped => "stopped",
        })
    }
}

type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

enum State {
    /// Not resolved yet; holds the waker of the last poll, if any
    Waiting(Option<Waker>),
    /// Not resolved yet; the handle was turned into a continuation
    Continuation(Continuation),
    Resolved(Outcome),
}

/// One-shot result slot shared by a `Timer` and its pending entry
pub(crate) struct Completion {
    state: Mutex<State>,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Completion {
            state: Mutex::new(State::Waiting(None)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Continuations never run under this lock, a poisoned slot still holds valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the slot. Returns `false` if it was already resolved.
    ///
    /// An attached continuation runs on the calling thread before this returns.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        let mut state = self.lock();
        if let State::Resolved(_) = *state {
            return false;
        }
        let previous = mem::replace(&mut *state, State::Resolved(outcome));
        drop(state);

        match previous {
            State::Waiting(Some(waker)) => waker.wake(),
            State::Continuation(continuation) => run_continuation(continuation, outcome),
            State::Waiting(None) | State::Resolved(_) => {}
        }
        true
    }

    fn is_resolved(&self) -> bool {
        matches!(*self.lock(), State::Resolved(_))
    }

    fn attach(&self, continuation: Continuation) {
        let mut state = self.lock();
        let resolved = match *state {
            State::Resolved(outcome) => Some(outcome),
            State::Waiting(_) | State::Continuation(_) => None,
        };
        match resolved {
            Some(outcome) => {
                drop(state);
                run_continuation(continuation, outcome);
            }
            None => *state = State::Continuation(continuation),
        }
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Outcome> {
        let mut state = self.lock();
        match &mut *state {
            State::Resolved(outcome) => Poll::Ready(*outcome),
            State::Waiting(waker) => {
                if !matches!(waker, Some(current) if current.will_wake(cx.waker())) {
                    *waker = Some(cx.waker().clone());
                }
                Poll::Pending
            }
            // `Timer::on_complete` consumes the handle, nobody is left to poll
            State::Continuation(_) => Poll::Pending,
        }
    }
}

fn run_continuation(continuation: Continuation, outcome: Outcome) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| continuation(outcome))) {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "<non-string panic payload>"
        };
        log::warn!(
            "Timer continuation panicked after {} outcome: {}",
            outcome,
            message
        );
    }
}

/// Handle to a scheduled timer
///
/// A `Timer` resolves exactly once, with [`Outcome::Elapsed`] when its
/// deadline passes, [`Outcome::Cancelled`] after [`Timer::cancel`], or
/// [`Outcome::Stopped`] if its service shuts down first. It can be awaited on
/// any executor, waited on synchronously, or turned into a continuation.
///
/// Dropping a `Timer` does not cancel it.
pub struct Timer {
    key: TimerKey,
    completion: Arc<Completion>,
    service: Weak<Shared>,
}

impl Timer {
    pub(crate) fn new(key: TimerKey, completion: Arc<Completion>, service: Weak<Shared>) -> Self {
        Timer {
            key,
            completion,
            service,
        }
    }

    /// A timer that is already resolved and belongs to no service
    pub(crate) fn resolved(key: TimerKey, outcome: Outcome) -> Self {
        let completion = Completion::new();
        completion.resolve(outcome);
        Timer::new(key, completion, Weak::new())
    }

    /// The absolute deadline this timer was scheduled for
    pub fn deadline(&self) -> Instant {
        self.key.deadline
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Cancel the timer
    ///
    /// If the timer is still pending it is removed from its service and
    /// resolved with [`Outcome::Cancelled`] on the calling thread. Cancelling a
    /// timer that already fired, was already cancelled, or whose service is
    /// gone does nothing.
    pub fn cancel(&self) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        if let Some(completion) = service.remove(self.key) {
            completion.resolve(Outcome::Cancelled);
        }
    }

    /// Run `f` with the outcome once the timer resolves
    ///
    /// When the timer fires, `f` runs on the service's worker thread and holds
    /// up every other timer of that service until it returns; hand expensive
    /// work off to another executor. If the timer is cancelled, `f` runs on
    /// the cancelling thread. If it is already resolved, `f` runs right here.
    ///
    /// A panic inside `f` is caught and logged.
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.completion.attach(Box::new(f));
    }

    /// Block the current thread until the timer resolves
    ///
    /// Must not be called from a continuation of the same service: the worker
    /// would wait on itself.
    pub fn wait(self) -> Outcome {
        futures::executor::block_on(self)
    }
}

impl Future for Timer {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        self.completion.poll_outcome(cx)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.key.deadline)
            .field("seq", &self.key.seq)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
