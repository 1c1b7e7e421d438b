use std::{
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use dispatch::{Dispatcher, Job};
use timer::TimerQueue;

pub(crate) use timer::TimerHandle;

mod dispatch;
pub(crate) mod registry;
mod timer;

/// Process-wide background machinery: one timer thread and one worker for
/// deferred continuations. Both are started on first use.
pub(crate) struct Reactor {
    timers: Arc<TimerQueue>,
    dispatcher: Dispatcher,
}

static REACTOR: OnceLock<Reactor> = OnceLock::new();

impl Reactor {
    fn get() -> &'static Reactor {
        REACTOR.get_or_init(|| {
            let timers = Arc::new(TimerQueue::new());
            let (dispatcher, rx) = Dispatcher::new();

            {
                let timers = timers.clone();
                thread::Builder::new()
                    .name("rearm-timer".into())
                    .spawn(move || timers.run())
                    .expect("failed to spawn timer thread");
            }

            thread::Builder::new()
                .name("rearm-dispatch".into())
                .spawn(move || Dispatcher::run(rx))
                .expect("failed to spawn dispatch thread");

            Reactor { timers, dispatcher }
        })
    }

    /// Run `f` on the timer thread once `after` has elapsed, unless the
    /// returned handle is disarmed first.
    pub fn schedule(after: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        Self::get().timers.schedule(after, Box::new(f))
    }

    /// Run `job` on the dispatch thread.
    pub fn defer(job: Job) {
        Self::get().dispatcher.submit(job)
    }
}
