//! Async timer related futures.
//!
//! The main use-case for this is to put a task to sleep for a specific period
//! of time. Timers share the crate's single background timer thread, the same
//! one that drives [CompletionSource](crate::source::CompletionSource)
//! timeouts; each sleep is in fact a source whose timeout policy reports
//! success.
//!
//! # Example
//! Let's put a task to sleep for 200 milliseconds.
//! ```
//! use rearm::futures::timer::Timer;
//! use rearm::task::Executor;
//! use std::time::{Duration, Instant};
//! Executor::block_on(async {
//!     let now = Instant::now();
//!
//!     Timer::sleep(Duration::from_millis(200)).await;
//!
//!     assert!(now.elapsed() >= Duration::from_millis(200));
//! });
//! ```
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use crate::source::{Completion, CompletionSource, Hooks, Outcome};

struct Elapsed;

impl Hooks<()> for Elapsed {
    type Data = ();

    fn on_timeout(&self, _after: Duration) -> Outcome<()> {
        Outcome::Success(())
    }
}

/// Asynchronous timer.
///
/// This structure is a future that will expire at some point in the future. It
/// can be obtained via the [Timer::sleep] function.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Timer {
    completion: Completion<(), Elapsed>,
}

impl Timer {
    /// Put the current task to sleep for the specified duration.
    ///
    /// This function returns a future, that when `.await`ed will suspend the
    /// execution of the current task until the specified duration has elapsed.
    /// At that point the runtime will queue the task for execution. Note that
    /// it is guaranteed that the task will be suspended for *at least* the
    /// specified duration; it could sleep for longer.
    pub fn sleep(d: Duration) -> Self {
        let completion = CompletionSource::with_hooks(Elapsed)
            .arm(Some(d), None)
            .expect("a fresh source is always idle");

        Self { completion }
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx).map(|_| ())
    }
}
