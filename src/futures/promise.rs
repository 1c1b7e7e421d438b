//! One-shot promises.
//!
//! A [Promise] is the conventional, single-use counterpart to a
//! [CompletionSource](crate::source::CompletionSource): it is allocated per
//! operation, can be completed exactly once and never reset. Any number of
//! clones may race to complete it; the first `try_set_*` call wins and the
//! others return `false`.
//!
//! # Example
//!
//! ```
//! use rearm::futures::promise::Promise;
//! use rearm::task::Executor;
//! use std::thread;
//!
//! let promise = Promise::new();
//!
//! {
//!     let promise = promise.clone();
//!     thread::spawn(move || promise.try_set_result("hi"));
//! }
//!
//! assert_eq!(Executor::block_on(promise).unwrap(), "hi");
//! ```
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    thread,
};

use crate::{
    cancel::CancelCause,
    error::{Error, Result},
    source::{CompletionStatus, Outcome, ResultSlot, Status},
    task::thread_waker,
};

struct State<T> {
    slot: ResultSlot<T>,
    waker: Option<Waker>,
}

/// A single-use, thread-safe promise.
///
/// See the [module-level documentation](self) for more information.
pub struct Promise<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                slot: ResultSlot::new(),
                waker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.lock().unwrap()
    }

    fn try_set(&self, outcome: Outcome<T>) -> bool {
        let waker = {
            let mut state = self.lock();

            if state.slot.is_set() {
                return false;
            }

            state.slot.set(outcome);
            state.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.try_set(Outcome::Success(value))
    }

    /// Fail the promise. A cancellation error marks it canceled rather than
    /// faulted.
    pub fn try_set_error(&self, e: Error) -> bool {
        self.try_set(Outcome::from_error(e))
    }

    pub fn try_set_canceled(&self, cause: impl Into<CancelCause>) -> bool {
        self.try_set(Outcome::Canceled(cause.into()))
    }

    pub fn is_completed(&self) -> bool {
        self.lock().slot.is_set()
    }

    pub fn status(&self) -> CompletionStatus {
        self.lock().slot.status()
    }

    /// Take the result if the promise has completed, otherwise remember
    /// `waker`.
    fn poll_take(&self, waker: &Waker) -> Poll<Result<T>> {
        let mut state = self.lock();

        if !state.slot.is_set() {
            state.waker = Some(waker.clone());
            return Poll::Pending;
        }

        Poll::Ready(match state.slot.take() {
            Some(outcome) => outcome.into_result(),
            None => Err(Error::InvalidState {
                op: "take the result of",
                status: Status::Consumed,
            }),
        })
    }

    /// Block the current thread until the promise completes and take its
    /// result.
    pub fn wait(self) -> Result<T> {
        let waker = thread_waker();

        loop {
            if let Poll::Ready(r) = self.poll_take(&waker) {
                return r;
            }

            thread::park();
        }
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_take(cx.waker())
    }
}
