use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::mpsc::{channel, Receiver, Sender},
};

use log::error;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Runs deferred continuations on a dedicated thread, in submission order.
pub(crate) struct Dispatcher {
    tx: Sender<Job>,
}

impl Dispatcher {
    pub fn new() -> (Self, Receiver<Job>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, job: Job) {
        if self.tx.send(job).is_err() {
            error!("dispatch thread is gone, dropping deferred continuation");
        }
    }

    pub fn run(rx: Receiver<Job>) {
        for job in rx {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("deferred continuation panicked");
            }
        }
    }
}
