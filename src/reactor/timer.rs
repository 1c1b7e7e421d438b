use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use log::{error, trace};

use super::registry::{Key, Registry};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    key: Key,
    seq: u64,
}

// Reversed so `BinaryHeap` pops the earliest deadline first.
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<Deadline>,
    callbacks: Registry<Callback>,
    seq: u64,
}

pub(crate) struct TimerQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                callbacks: Registry::new(),
                seq: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Schedule `f` to run once `after` has elapsed. A deadline too far out to
    /// be represented as an [Instant] never fires; the callback is only kept
    /// until the handle is disarmed.
    pub fn schedule(self: &Arc<Self>, after: Duration, f: Callback) -> TimerHandle {
        let at = Instant::now().checked_add(after);
        let mut state = self.state.lock().unwrap();

        let key = state.callbacks.insert(f);
        let seq = state.seq;
        state.seq += 1;

        match at {
            Some(at) => {
                state.heap.push(Deadline { at, key, seq });
                trace!("timer {seq} scheduled in {after:?}");
                self.cond.notify_all();
            }
            None => trace!("timer {seq} scheduled beyond the clock's range, never fires"),
        }

        TimerHandle {
            entry: Some((self.clone(), key)),
        }
    }

    /// Run expired callbacks forever. Disarmed entries that have not been
    /// swept yet are skipped when they surface.
    pub fn run(&self) {
        let mut state = self.state.lock().unwrap();

        loop {
            let now = Instant::now();

            let Some(next) = state.heap.peek() else {
                state = self.cond.wait(state).unwrap();
                continue;
            };

            if next.at > now {
                let wait = next.at - now;
                state = self.cond.wait_timeout(state, wait).unwrap().0;
                continue;
            }

            let Some(Deadline { key, seq, .. }) = state.heap.pop() else {
                continue;
            };

            let Some(f) = state.callbacks.take_for_run(key) else {
                continue;
            };

            drop(state);

            trace!("timer {seq} fired");
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!("timer {seq} callback panicked");
            }

            state = self.state.lock().unwrap();
            state.callbacks.finish_run();
            self.cond.notify_all();
        }
    }

    fn disarm(&self, key: Key) {
        let mut state = self.state.lock().unwrap();

        if state.callbacks.remove(key).is_some() {
            state.compact();
            return;
        }

        while state.callbacks.running_elsewhere(key) {
            state = self.cond.wait(state).unwrap();
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().callbacks.len()
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }
}

// Heap entries of disarmed timers left before they are swept out.
const SLACK: usize = 64;

impl State {
    /// Drop heap entries whose callback has been disarmed once they outnumber
    /// the live ones, keeping the heap proportional to the armed timers.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.callbacks.len() + SLACK {
            return;
        }

        let callbacks = &self.callbacks;
        self.heap.retain(|d| callbacks.contains(d.key));
    }
}

/// A scheduled timer callback. Dropping the handle disarms the timer.
#[must_use = "dropping a timer handle disarms it"]
pub struct TimerHandle {
    entry: Option<(Arc<TimerQueue>, Key)>,
}

impl TimerHandle {
    /// Disarm the timer. After this returns the callback will not start; if it
    /// is already running on the timer thread this waits for it to return.
    pub fn disarm(mut self) {
        self.disarm_inner();
    }

    fn disarm_inner(&mut self) {
        if let Some((queue, key)) = self.entry.take() {
            queue.disarm(key);
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.disarm_inner();
    }
}
