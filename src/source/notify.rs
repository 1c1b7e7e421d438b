use std::{
    fmt,
    ops::BitOr,
    task::Waker,
};

use log::trace;

use crate::reactor::Reactor;

/// Delivery flags for a continuation registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuationFlags(u8);

impl ContinuationFlags {
    pub const NONE: Self = Self(0);

    /// Always run the continuation on the dispatch thread, never on the thread
    /// that completed the source.
    pub const DEFERRED: Self = Self(1);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContinuationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Something to run once the current generation completes.
pub(crate) enum Continuation {
    Waker(Waker),
    Callback(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waker(w) => f.debug_tuple("Waker").field(w).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl Continuation {
    /// Wakers only queue a task or unpark a thread; callbacks run user code.
    pub fn may_block(&self) -> bool {
        matches!(self, Continuation::Callback(_))
    }

    fn run(self) {
        match self {
            Continuation::Waker(w) => w.wake(),
            Continuation::Callback(f) => f(),
        }
    }
}

/// A continuation together with how it should be delivered.
///
/// Produced under the source's lock and run only after the lock has been
/// released.
#[must_use]
pub(crate) struct Notification {
    continuation: Continuation,
    deferred: bool,
}

impl Notification {
    pub fn new(continuation: Continuation, flags: ContinuationFlags, deferred_by_default: bool) -> Self {
        Self {
            continuation,
            deferred: deferred_by_default || flags.contains(ContinuationFlags::DEFERRED),
        }
    }

    pub fn deliver(self) {
        if self.deferred {
            trace!("deferring continuation {:?}", self.continuation);
            let continuation = self.continuation;
            Reactor::defer(Box::new(move || continuation.run()));
        } else {
            trace!("running continuation {:?} inline", self.continuation);
            self.continuation.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc::channel, Arc, Mutex},
        thread,
        time::Duration,
    };

    use super::{Continuation, ContinuationFlags, Notification};

    #[test]
    fn flags() {
        let f = ContinuationFlags::NONE | ContinuationFlags::DEFERRED;
        assert!(f.contains(ContinuationFlags::DEFERRED));
        assert!(!ContinuationFlags::NONE.contains(ContinuationFlags::DEFERRED));
        assert!(ContinuationFlags::DEFERRED.contains(ContinuationFlags::NONE));
    }

    #[test]
    fn inline_runs_on_caller() {
        let ran_on = Arc::new(Mutex::new(None));
        let r = ran_on.clone();

        Notification::new(
            Continuation::Callback(Box::new(move || {
                *r.lock().unwrap() = Some(thread::current().id())
            })),
            ContinuationFlags::NONE,
            false,
        )
        .deliver();

        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    }

    #[test]
    fn deferred_runs_elsewhere() {
        let (tx, rx) = channel();

        Notification::new(
            Continuation::Callback(Box::new(move || tx.send(thread::current().id()).unwrap())),
            ContinuationFlags::DEFERRED,
            false,
        )
        .deliver();

        let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(id, thread::current().id());
    }
}
