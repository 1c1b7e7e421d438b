use std::thread::{self, ThreadId};

use slab::Slab;

/// Identifies one registered callback.
///
/// Slab keys are recycled, so every entry also carries a unique id. A stale
/// key whose slot has been reused by a later registration never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Key {
    idx: usize,
    id: u64,
}

/// A set of one-shot callbacks that can be disarmed.
///
/// The registry itself holds no lock; owners keep it behind a `Mutex` and pair
/// it with a `Condvar` so disarming can wait out a callback that is currently
/// running on another thread.
pub(crate) struct Registry<F> {
    entries: Slab<(u64, F)>,
    next_id: u64,
    running: Option<(u64, ThreadId)>,
}

impl<F> Registry<F> {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            next_id: 0,
            running: None,
        }
    }

    pub fn insert(&mut self, f: F) -> Key {
        let id = self.next_id;
        self.next_id += 1;

        Key {
            idx: self.entries.insert((id, f)),
            id,
        }
    }

    /// Remove a callback that has not started yet.
    pub fn remove(&mut self, key: Key) -> Option<F> {
        match self.entries.get(key.idx) {
            Some((id, _)) if *id == key.id => Some(self.entries.remove(key.idx).1),
            _ => None,
        }
    }

    /// Remove a callback in order to run it. The caller must call
    /// [Registry::finish_run] once the callback has returned.
    pub fn take_for_run(&mut self, key: Key) -> Option<F> {
        let f = self.remove(key)?;
        self.running = Some((key.id, thread::current().id()));
        Some(f)
    }

    /// Like [Registry::take_for_run] for an arbitrary pending entry.
    pub fn take_any_for_run(&mut self) -> Option<F> {
        let (idx, (id, _)) = self.entries.iter().next()?;
        let key = Key { idx, id: *id };
        self.take_for_run(key)
    }

    pub fn finish_run(&mut self) {
        self.running = None;
    }

    /// True when the callback for `key` is executing on a thread other than
    /// the caller's. Disarming from inside the callback itself must not wait.
    pub fn running_elsewhere(&self, key: Key) -> bool {
        matches!(self.running, Some((id, thread)) if id == key.id && thread != thread::current().id())
    }

    pub fn contains(&self, key: Key) -> bool {
        matches!(self.entries.get(key.idx), Some((id, _)) if *id == key.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
