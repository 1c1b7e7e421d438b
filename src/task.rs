//! Task and execution management
//!
//! This module provides a small executor for driving [Completion]s and other
//! futures to completion. Like the rest of the crate family it uses a
//! per-thread executor model: the thread upon which a task is spawned is the
//! same thread that will execute it, and each thread needs to call one of
//! [Executor::block_on] or [Executor::run] to do any work.
//!
//! Unlike a purely single-threaded executor, tasks may be woken from *any*
//! thread. Completion sources are routinely completed by timer threads,
//! cancellation callbacks or worker threads; a wake from one of those queues
//! the task on its home executor and unparks that thread.
//!
//! # Example
//!
//! ```
//! use rearm::task::Executor;
//! let x = Executor::block_on(async { 2 + 8 });
//! assert_eq!(x, 10);
//! ```
//!
//! Awaiting a source that is completed from another thread:
//!
//! ```
//! use rearm::source::CompletionSource;
//! use rearm::task::Executor;
//! use std::thread;
//!
//! let source = CompletionSource::<u32>::new();
//! let completion = source.arm(None, None).unwrap();
//!
//! thread::spawn(move || source.try_set_result(7));
//!
//! assert_eq!(Executor::block_on(completion).unwrap(), 7);
//! ```
//!
//! [Completion]: crate::source::Completion
use std::{
    cell::RefCell,
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
};

use slab::Slab;

use crate::source::{Completion, CompletionSource};

/// Wake-ups delivered to one executor, possibly from other threads.
struct Shared {
    woken: Mutex<Vec<usize>>,
    thread: Thread,
}

struct TaskId {
    key: usize,
    shared: Arc<Shared>,
}

impl Wake for TaskId {
    fn wake(self: Arc<TaskId>) {
        self.shared.woken.lock().unwrap().push(self.key);
        self.shared.thread.unpark();
    }
}

struct Unparker(Thread);

impl Wake for Unparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

/// A waker that unparks the calling thread, for blocking waits outside an
/// executor.
pub(crate) fn thread_waker() -> Waker {
    Waker::from(Arc::new(Unparker(thread::current())))
}

struct Task {
    id: Arc<TaskId>,
    // `None` while the task is being polled.
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
}

/// The async executor.
///
/// A type that is responsible for pushing futures through to
/// completion. You can begin execution of a new task by calling the
/// [Executor::block_on] function.
pub struct Executor {
    tasks: Slab<Task>,
    run_q: Vec<usize>,
    shared: Arc<Shared>,
}

thread_local! {
    static EXEC: RefCell<Executor> = RefCell::new(Executor {
        tasks: Slab::new(),
        run_q: Vec::new(),
        shared: Arc::new(Shared {
            woken: Mutex::new(Vec::new()),
            thread: thread::current(),
        }),
    });
}

/// A handle to a running task.
///
/// You can call [TaskJoiner::join] from a synchronous context to block
/// execution and yield the future's value. If you want to wait for execution to
/// finish from an asynchronous context, use `.await` on the joiner. If the
/// joiner is dropped then execution of the future continues to completion but
/// the return value is lost, aka detach-on-drop.
pub struct TaskJoiner<T> {
    completion: Completion<T>,
}

impl<T: Send + 'static> TaskJoiner<T> {
    /// Run this thread's executor until the task has finished and return its
    /// value.
    ///
    /// *Note* This function should only be called from synchronous contexts. To
    /// prevent deadlocks in an asynchronous context, use `.await` instead.
    pub fn join(self) -> T {
        Executor::block_on(self)
    }
}

impl<T> Future for TaskJoiner<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion)
            .poll(cx)
            .map(|r| r.expect("task sources only complete with a value"))
    }
}

impl Executor {
    /// Spawn a new future and add it to this thread's run queue. If called from
    /// an already-running asynchronous task, the future will be queued for
    /// execution. If called from a synchronous context, the task will *not* be
    /// executed until [Executor::run] is called.
    ///
    /// A [TaskJoiner] is returned which can be used to wait for completion of
    /// the future `f` and obtain its return value.
    pub fn spawn<Fut, T>(f: Fut) -> TaskJoiner<T>
    where
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let source = CompletionSource::new();
        let completion = source
            .arm(None, None)
            .expect("a fresh source is always idle");

        let fut = async move {
            let value = f.await;
            source.try_set_result(value);
        };

        EXEC.with(|exec| {
            let mut exec = exec.borrow_mut();
            let shared = exec.shared.clone();
            let slot = exec.tasks.vacant_entry();
            let key = slot.key();

            slot.insert(Task {
                id: Arc::new(TaskId { key, shared }),
                future: Some(Box::pin(fut)),
            });
            exec.run_q.push(key);
        });

        TaskJoiner { completion }
    }

    /// A convenience function for waiting on a future from a synchronous
    /// context. This is the equivalent of calling:
    ///
    /// ```
    /// # use rearm::task::Executor;
    /// # use std::future::Future;
    /// # fn x<Fut: Future<Output = ()> + Send + 'static>(f: Fut) {
    /// let task = Executor::spawn(f);
    /// task.join();
    /// # }
    /// ```
    pub fn block_on<Fut, T>(f: Fut) -> T
    where
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let joiner = Self::spawn(f);

        Self::executor_loop();

        joiner
            .completion
            .result()
            .expect("executor returned before the task finished")
    }

    /// Run the executor for this thread.
    ///
    /// This function will schedule and run all tasks that have been previously
    /// spawned with [Executor::spawn]. *Note* each thread has its own set of
    /// tasks and execution environment. If you call this function, only tasks
    /// that have been spawned on *this* thread will be executed.
    ///
    /// Blocks until all tasks have finished executing.
    pub fn run() {
        Self::executor_loop()
    }

    fn collect_woken(&mut self) {
        let woken = mem::take(&mut *self.shared.woken.lock().unwrap());
        self.run_q.extend(woken);
    }

    fn executor_loop() {
        EXEC.with(|exec| loop {
            let next = {
                let mut exec = exec.borrow_mut();
                exec.collect_woken();

                if exec.tasks.is_empty() {
                    return;
                }

                exec.run_q.pop()
            };

            let Some(key) = next else {
                thread::park();
                continue;
            };

            // Stale wake-ups for finished tasks are skipped.
            let Some((id, mut future)) = exec
                .borrow_mut()
                .tasks
                .get_mut(key)
                .and_then(|task| Some((task.id.clone(), task.future.take()?)))
            else {
                continue;
            };

            let waker = Waker::from(id);
            let mut cx = Context::from_waker(&waker);

            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    exec.borrow_mut().tasks.remove(key);
                }
                Poll::Pending => {
                    if let Some(task) = exec.borrow_mut().tasks.get_mut(key) {
                        task.future = Some(future);
                    }
                }
            }
        });
    }
}
