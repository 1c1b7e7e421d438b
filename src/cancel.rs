//! Cancellation signals.
//!
//! A [CancellationToken] is a shared, one-way switch. Interested parties
//! [register](CancellationToken::register) a callback which runs once when the
//! token is canceled, and receive a [CancelRegistration] that can disarm the
//! callback again. After [CancelRegistration::disarm] returns, the callback is
//! guaranteed not to start.
//!
//! # Example
//!
//! ```
//! use rearm::cancel::{CancelCause, CancellationToken};
//! use std::sync::{Arc, Mutex};
//!
//! let token = CancellationToken::new();
//! let seen = Arc::new(Mutex::new(None));
//!
//! let _reg = {
//!     let seen = seen.clone();
//!     token.register(move |cause| *seen.lock().unwrap() = Some(cause))
//! };
//!
//! assert!(token.cancel("shutting down"));
//! assert_eq!(seen.lock().unwrap().as_ref().unwrap().reason(), "shutting down");
//! ```
use std::{
    fmt::{self, Display},
    sync::{Arc, Condvar, Mutex},
};

use log::trace;

use crate::reactor::registry::{Key, Registry};

/// Why something was canceled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCause(Arc<str>);

impl CancelCause {
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CancelCause {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CancelCause {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

type Callback = Box<dyn FnOnce(CancelCause) + Send>;

struct State {
    cause: Option<CancelCause>,
    callbacks: Registry<Callback>,
}

struct Shared {
    state: Mutex<State>,
    idle: Condvar,
}

/// A shared cancellation signal.
///
/// Cloning a token yields another handle to the same signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Shared>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cause", &self.cause())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    cause: None,
                    callbacks: Registry::new(),
                }),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().unwrap().cause.is_some()
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.inner.state.lock().unwrap().cause.clone()
    }

    /// Cancel the token, running every registered callback on the calling
    /// thread. Returns `false` if the token had already been canceled, in which
    /// case `cause` is discarded.
    pub fn cancel(&self, cause: impl Into<CancelCause>) -> bool {
        let cause = cause.into();
        let mut state = self.inner.state.lock().unwrap();

        if state.cause.is_some() {
            return false;
        }

        trace!("cancellation token canceled: {cause}");
        state.cause = Some(cause.clone());

        while let Some(f) = state.callbacks.take_any_for_run() {
            drop(state);
            f(cause.clone());
            state = self.inner.state.lock().unwrap();
            state.callbacks.finish_run();
            self.inner.idle.notify_all();
        }

        true
    }

    /// Register a callback to run when the token is canceled.
    ///
    /// If the token has already been canceled, `f` runs immediately on the
    /// calling thread and the returned registration is inert.
    pub fn register(&self, f: impl FnOnce(CancelCause) + Send + 'static) -> CancelRegistration {
        let mut state = self.inner.state.lock().unwrap();

        if let Some(cause) = state.cause.clone() {
            drop(state);
            f(cause);
            return CancelRegistration { entry: None };
        }

        let key = state.callbacks.insert(Box::new(f));

        CancelRegistration {
            entry: Some((self.inner.clone(), key)),
        }
    }
}

/// A callback registered against a [CancellationToken].
///
/// Dropping the registration disarms it.
#[must_use = "dropping a registration disarms it"]
pub struct CancelRegistration {
    entry: Option<(Arc<Shared>, Key)>,
}

impl CancelRegistration {
    /// Disarm the callback.
    ///
    /// If the callback is running on another thread, this blocks until it has
    /// returned. Disarming from within the callback itself does not block.
    pub fn disarm(mut self) {
        self.disarm_inner();
    }

    fn disarm_inner(&mut self) {
        let Some((shared, key)) = self.entry.take() else {
            return;
        };

        let mut state = shared.state.lock().unwrap();

        if state.callbacks.remove(key).is_some() {
            return;
        }

        while state.callbacks.running_elsewhere(key) {
            state = shared.idle.wait(state).unwrap();
        }
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.disarm_inner();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    use super::{CancelCause, CancellationToken};

    #[test]
    fn callbacks_run_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let regs: Vec<_> = (0..3)
            .map(|_| {
                let hits = hits.clone();
                token.register(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert!(token.cancel("first"));
        assert!(!token.cancel("second"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(token.cause(), Some(CancelCause::new("first")));

        drop(regs);
    }

    #[test]
    fn disarmed_callback_never_runs() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let reg = {
            let hits = hits.clone();
            token.register(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        reg.disarm();
        token.cancel("late");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn register_after_cancel_runs_inline() {
        let token = CancellationToken::new();
        token.cancel("gone");

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move |cause| {
            assert_eq!(cause.reason(), "gone");
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarm_waits_for_running_callback() {
        let token = CancellationToken::new();
        let started = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicUsize::new(0));

        let reg = {
            let started = started.clone();
            let done = done.clone();
            token.register(move |_| {
                started.wait();
                thread::sleep(Duration::from_millis(100));
                done.store(1, Ordering::SeqCst);
            })
        };

        let canceler = {
            let token = token.clone();
            thread::spawn(move || token.cancel("bye"))
        };

        started.wait();
        reg.disarm();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        assert!(canceler.join().unwrap());
    }
}
