//! Resettable completion sources.
//!
//! A [CompletionSource] is the producer side of a future whose storage is
//! reused across many operations. Each use follows the same cycle:
//!
//! ```text
//!   Idle ──arm()──► Armed ──first completion wins──► Completed
//!    ▲                                                   │
//!    └──────reset()────── Consumed ◄──────consume()──────┘
//! ```
//!
//! [arm](CompletionSource::arm) hands out a [Completion]: a cheap
//! `(source, token)` pair which can be `.await`ed, polled for its
//! [status](Completion::status) or consumed directly. The [Token] names the
//! generation the handle belongs to; once the source is reset every handle from
//! an earlier generation is rejected with [Error::InvalidToken].
//!
//! Completion can be attempted from any number of threads at once, manually
//! via [CompletionSource::completer] or automatically by the optional timeout
//! and [CancellationToken] given to `arm`. Exactly one attempt per generation
//! succeeds; the rest return `false` and have no effect.
//!
//! # Example
//!
//! ```
//! use rearm::source::{CompletionSource, CompletionStatus};
//! use std::thread;
//!
//! let source = CompletionSource::<u32>::new();
//!
//! for i in 0..3 {
//!     let completion = source.arm(None, None).unwrap();
//!
//!     let producer = {
//!         let source = source.clone();
//!         thread::spawn(move || assert!(source.try_set_result(i * 10)))
//!     };
//!     producer.join().unwrap();
//!
//!     assert_eq!(completion.status().unwrap(), CompletionStatus::Succeeded);
//!     assert_eq!(completion.result().unwrap(), i * 10);
//!
//!     source.reset().unwrap();
//! }
//! ```
use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll, Waker},
    thread,
    time::Duration,
};

use log::{debug, trace};

use crate::{
    cancel::{CancelCause, CancellationToken},
    error::{Error, Result},
    task::thread_waker,
};

use notify::{Continuation, Notification};
use registration::Registration;
use status::VersionedStatus;

pub(crate) use slot::ResultSlot;

pub use notify::ContinuationFlags;
pub use slot::{CompletionStatus, Outcome};
pub use status::{Status, Token};

mod notify;
mod registration;
mod slot;
mod status;

/// Policy points of a [CompletionSource].
///
/// Every method has a default, so `impl Hooks<T> for MyHooks { type Data = (); }`
/// is a valid implementation.
pub trait Hooks<T>: Send + Sync + Sized + 'static {
    /// Opaque payload supplied by the completer and handed to
    /// [Hooks::on_consumed]. It is not part of the result.
    type Data: Send + 'static;

    /// The outcome stored when the timeout given to
    /// [arm](CompletionSource::arm) elapses first.
    fn on_timeout(&self, after: Duration) -> Outcome<T> {
        Outcome::Fault(Error::TimedOut(after))
    }

    /// The outcome stored when the cancellation token given to
    /// [arm](CompletionSource::arm) fires first.
    fn on_canceled(&self, cause: CancelCause) -> Outcome<T> {
        Outcome::Canceled(cause)
    }

    /// Called after a result has been consumed, outside the source's lock.
    ///
    /// This is where a pool takes the source back; calling
    /// [reset](CompletionSource::reset) from here is allowed.
    fn on_consumed(&self, source: &Arc<CompletionSource<T, Self>>, data: Option<Self::Data>) {
        let _ = (source, data);
    }
}

/// Hooks with every default in place and no completion data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl<T> Hooks<T> for DefaultHooks {
    type Data = ();
}

/// Configuration of a [CompletionSource].
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    deferred: bool,
    label: Option<&'static str>,
}

impl SourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, continuations never run on the thread that completed the
    /// source; they are handed to a background dispatch thread instead.
    ///
    /// Callbacks registered with [CompletionSource::on_completed] are always
    /// delivered this way when a timeout completes the source, since the
    /// process-wide timer thread must not be blocked by user code. Task
    /// wakers are still woken inline.
    pub fn deferred_continuations(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    /// Name used for this source in log records.
    pub fn label(mut self, label: &'static str) -> Self {
        self.label = Some(label);
        self
    }
}

struct Inner<T, D> {
    state: VersionedStatus,
    slot: ResultSlot<T>,
    data: Option<D>,
    registration: Registration,
    continuation: Option<(Continuation, ContinuationFlags)>,
}

/// A reusable producer/consumer future.
///
/// See the [module-level documentation](self) for more information.
pub struct CompletionSource<T, H: Hooks<T> = DefaultHooks> {
    inner: Mutex<Inner<T, H::Data>>,
    // Cleared whenever the source stops accepting completions. Only ever read
    // as a hint; the decision is always re-made under `inner`.
    completable: AtomicBool,
    hooks: H,
    options: SourceOptions,
}

impl<T> CompletionSource<T> {
    pub fn new() -> Arc<Self> {
        Self::with_hooks(DefaultHooks)
    }
}

impl<T, H: Hooks<T>> CompletionSource<T, H> {
    pub fn with_hooks(hooks: H) -> Arc<Self> {
        Self::with_options(hooks, SourceOptions::default())
    }

    pub fn with_options(hooks: H, options: SourceOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: VersionedStatus::new(),
                slot: ResultSlot::new(),
                data: None,
                registration: Registration::default(),
                continuation: None,
            }),
            completable: AtomicBool::new(false),
            hooks,
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T, H::Data>> {
        self.inner.lock().unwrap()
    }

    fn label(&self) -> &'static str {
        self.options.label.unwrap_or("source")
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// The current generation.
    pub fn token(&self) -> Token {
        self.lock().state.token()
    }

    pub fn lifecycle(&self) -> Status {
        self.lock().state.status()
    }

    /// `true` once a completion has won the race for the current generation.
    pub fn is_completed(&self) -> bool {
        matches!(self.lifecycle(), Status::Completed | Status::Consumed)
    }

    /// Start a new operation.
    ///
    /// The source must be [Status::Idle]. If `timeout` is given, the operation
    /// completes with [Hooks::on_timeout] once it elapses; if `cancel` is
    /// given, it completes with [Hooks::on_canceled] when the token fires.
    /// Whichever of these and the manual completers comes first wins.
    pub fn arm(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Completion<T, H>>
    where
        T: Send + 'static,
    {
        let token = {
            let mut inner = self.lock();
            let token = inner
                .state
                .transition("arm", None, Status::Idle, Status::Armed)?;
            self.completable.store(true, Ordering::Release);
            token
        };

        debug!("{}: armed {token}, timeout {timeout:?}", self.label());

        if timeout.is_some() || cancel.is_some() {
            let on_timeout = {
                let source = Arc::downgrade(self);
                move |after: Duration| {
                    if let Some(source) = source.upgrade() {
                        source.complete(
                            Some(token),
                            || source.hooks.on_timeout(after),
                            None,
                            true,
                        );
                    }
                }
            };

            let on_cancel = {
                let source = Arc::downgrade(self);
                move |cause: CancelCause| {
                    if let Some(source) = source.upgrade() {
                        source.complete(
                            Some(token),
                            || source.hooks.on_canceled(cause),
                            None,
                            false,
                        );
                    }
                }
            };

            let registration = Registration::arm(timeout, cancel, on_timeout, on_cancel);

            let mut inner = self.lock();
            if inner.state.token() == token && inner.state.status() == Status::Armed {
                inner.registration = registration;
            } else {
                // Already completed, possibly by a pre-canceled token.
                drop(inner);
                registration.disarm();
            }
        }

        Ok(Completion {
            source: self.clone(),
            token,
        })
    }

    /// Build a completion attempt carrying an optional token and completion
    /// data.
    pub fn completer(&self) -> Completer<'_, T, H> {
        Completer {
            source: self,
            token: None,
            data: None,
        }
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.completer().set_result(value)
    }

    pub fn try_set_error(&self, e: Error) -> bool {
        self.completer().set_error(e)
    }

    pub fn try_set_canceled(&self, cause: impl Into<CancelCause>) -> bool {
        self.completer().set_canceled(cause.into())
    }

    /// The single completion path. `outcome` is only evaluated when the
    /// source still looks completable, and never under the lock. `defer`
    /// forces callback continuations off the completing thread.
    fn complete(
        &self,
        token: Option<Token>,
        outcome: impl FnOnce() -> Outcome<T>,
        data: Option<H::Data>,
        defer: bool,
    ) -> bool {
        if !self.completable.load(Ordering::Acquire) {
            return false;
        }

        let outcome = outcome();

        let mut inner = self.lock();

        let token = match inner
            .state
            .transition("complete", token, Status::Armed, Status::Completed)
        {
            Ok(token) => token,
            Err(e) => {
                trace!("{}: completion rejected: {e}", self.label());
                return false;
            }
        };

        self.completable.store(false, Ordering::Release);

        inner.slot.set(outcome);
        inner.data = data;

        let status = inner.slot.status();
        let registration = mem::take(&mut inner.registration);
        let notification = inner
            .continuation
            .take()
            .map(|(c, flags)| {
                let deferred = self.options.deferred || (defer && c.may_block());
                Notification::new(c, flags, deferred)
            });

        drop(inner);

        trace!("{}: {token} completed as {status:?}", self.label());

        registration.disarm();

        if let Some(notification) = notification {
            notification.deliver();
        }

        true
    }

    /// Observe the outcome classification of generation `token`.
    pub fn status(&self, token: Token) -> Result<CompletionStatus> {
        let inner = self.lock();
        inner.state.check_token(token)?;
        Ok(inner.slot.status())
    }

    /// Run `f` once generation `token` has completed.
    ///
    /// If it has already completed, `f` is delivered straight away. Only one
    /// continuation may be registered per generation, so this fails while a
    /// task is awaiting the generation.
    pub fn on_completed(
        &self,
        token: Token,
        f: impl FnOnce() + Send + 'static,
        flags: ContinuationFlags,
    ) -> Result<()> {
        self.register(token, Continuation::Callback(Box::new(f)), flags)
            .map(|_| ())
    }

    /// Store `continuation` for generation `token`, or deliver it immediately
    /// if that generation has already completed. Returns whether it completed.
    fn register(
        &self,
        token: Token,
        continuation: Continuation,
        flags: ContinuationFlags,
    ) -> Result<bool> {
        let mut inner = self.lock();
        inner.state.check_token(token)?;

        match inner.state.status() {
            Status::Armed => {
                if inner.continuation.is_some() {
                    return Err(Error::InvalidState {
                        op: "attach a second continuation to",
                        status: Status::Armed,
                    });
                }

                inner.continuation = Some((continuation, flags));
                Ok(false)
            }
            Status::Completed | Status::Consumed => {
                drop(inner);
                Notification::new(continuation, flags, self.options.deferred).deliver();
                Ok(true)
            }
            Status::Idle => Err(Error::InvalidState {
                op: "await",
                status: Status::Idle,
            }),
        }
    }

    /// Like [CompletionSource::register] for a task waker, but never
    /// delivers: a completed generation is reported through the return value
    /// instead of a wake-up.
    fn poll_completed(&self, token: Token, waker: &Waker) -> Result<bool> {
        let mut inner = self.lock();
        inner.state.check_token(token)?;

        match inner.state.status() {
            Status::Armed => {
                if let Some((Continuation::Callback(_), _)) = inner.continuation {
                    return Err(Error::InvalidState {
                        op: "await a continuation-linked",
                        status: Status::Armed,
                    });
                }

                let registered = matches!(
                    &inner.continuation,
                    Some((Continuation::Waker(w), _)) if w.will_wake(waker)
                );

                if !registered {
                    inner.continuation =
                        Some((Continuation::Waker(waker.clone()), ContinuationFlags::NONE));
                }

                Ok(false)
            }
            Status::Completed | Status::Consumed => Ok(true),
            Status::Idle => Err(Error::InvalidState {
                op: "await",
                status: Status::Idle,
            }),
        }
    }

    /// Take the result of generation `token`.
    ///
    /// Legal exactly once per generation, after it has completed. Runs
    /// [Hooks::on_consumed] before returning the value or re-raising the
    /// stored failure.
    pub fn consume(self: &Arc<Self>, token: Token) -> Result<T> {
        let (outcome, data) = {
            let mut inner = self.lock();
            inner.state.check_token(token)?;

            let outcome = match inner.state.status() {
                Status::Completed => inner.slot.take(),
                status => return Err(Error::InvalidState {
                    op: "consume",
                    status,
                }),
            };

            inner
                .state
                .transition("consume", None, Status::Completed, Status::Consumed)?;

            (outcome, inner.data.take())
        };

        let outcome = outcome.expect("completed source holds an outcome");

        trace!("{}: {token} consumed", self.label());

        self.hooks.on_consumed(self, data);

        outcome.into_result()
    }

    /// Make the source reusable under a new generation.
    ///
    /// Legal once the current result has been consumed, or when the current
    /// generation was never armed. Returns the new generation.
    pub fn reset(&self) -> Result<Token> {
        let (registration, continuation, old, new) = {
            let mut inner = self.lock();

            match inner.state.status() {
                Status::Consumed | Status::Idle => {}
                status => return Err(Error::InvalidState { op: "reset", status }),
            }

            let old = inner.state.token();
            inner.slot.clear();
            inner.data = None;
            let new = inner.state.advance();

            (
                mem::take(&mut inner.registration),
                inner.continuation.take(),
                old,
                new,
            )
        };

        registration.disarm();
        drop(continuation);

        debug!("{}: reset {old} -> {new}", self.label());

        Ok(new)
    }
}

impl<T, H: Hooks<T>> fmt::Debug for CompletionSource<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CompletionSource")
            .field("label", &self.label())
            .field("token", &inner.state.token())
            .field("status", &inner.state.status())
            .field("outcome", &inner.slot.status())
            .finish()
    }
}

/// A pending completion attempt, see [CompletionSource::completer].
#[must_use = "a completer does nothing until one of its set methods is called"]
pub struct Completer<'a, T, H: Hooks<T>> {
    source: &'a CompletionSource<T, H>,
    token: Option<Token>,
    data: Option<H::Data>,
}

impl<T, H: Hooks<T>> Completer<'_, T, H> {
    /// Only complete if the source is still at generation `token`.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Forward `data` to [Hooks::on_consumed] if this attempt wins.
    pub fn with_data(mut self, data: H::Data) -> Self {
        self.data = Some(data);
        self
    }

    pub fn set_result(self, value: T) -> bool {
        self.complete_with(move || Outcome::Success(value))
    }

    /// Complete with an error. [Error::Canceled] is stored as a cancellation,
    /// any other error as a fault.
    pub fn set_error(self, e: Error) -> bool {
        self.complete_with(move || Outcome::from_error(e))
    }

    pub fn set_canceled(self, cause: CancelCause) -> bool {
        self.complete_with(move || Outcome::Canceled(cause))
    }

    pub fn complete(self, outcome: Outcome<T>) -> bool {
        self.complete_with(move || outcome)
    }

    fn complete_with(self, outcome: impl FnOnce() -> Outcome<T>) -> bool {
        self.source.complete(self.token, outcome, self.data, false)
    }
}

/// The consumer handle of one generation of a [CompletionSource].
///
/// `.await`ing a completion yields its result, consuming it.
#[must_use = "a completion does nothing unless awaited or consumed"]
pub struct Completion<T, H: Hooks<T> = DefaultHooks> {
    pub(crate) source: Arc<CompletionSource<T, H>>,
    pub(crate) token: Token,
}

impl<T, H: Hooks<T>> Completion<T, H> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn source(&self) -> &Arc<CompletionSource<T, H>> {
        &self.source
    }

    pub fn status(&self) -> Result<CompletionStatus> {
        self.source.status(self.token)
    }

    pub fn on_completed(
        &self,
        f: impl FnOnce() + Send + 'static,
        flags: ContinuationFlags,
    ) -> Result<()> {
        self.source.on_completed(self.token, f, flags)
    }

    /// Consume the result. Fails with [Error::InvalidState] if the operation
    /// has not completed yet.
    pub fn result(self) -> Result<T> {
        self.source.consume(self.token)
    }

    /// Block the current thread until the operation completes, then consume
    /// the result.
    ///
    /// *Note* This should only be called from synchronous contexts; use
    /// `.await` inside tasks.
    pub fn wait(self) -> Result<T> {
        let waker = thread_waker();

        while !self.source.poll_completed(self.token, &waker)? {
            thread::park();
        }

        self.result()
    }
}

impl<T, H: Hooks<T>> fmt::Debug for Completion<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<T, H: Hooks<T>> Future for Completion<T, H> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.source.poll_completed(self.token, cx.waker()) {
            Ok(true) => Poll::Ready(self.source.consume(self.token)),
            Ok(false) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        io,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc::{channel, Receiver, Sender},
            Arc, Barrier, Mutex,
        },
        task::{Context, Poll, Wake, Waker},
        thread,
        time::{Duration, Instant},
    };

    use anyhow::Result;

    use super::{
        CompletionSource, CompletionStatus, ContinuationFlags, Hooks, Outcome, SourceOptions,
        Status,
    };
    use crate::{
        cancel::{CancelCause, CancellationToken},
        error::Error,
        futures::bridge::LinkedBridge,
        task::Executor,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn round_trip() -> Result<()> {
        init();
        let source = CompletionSource::new();
        let c = source.arm(None, None)?;
        let token = c.token();

        assert_eq!(c.status()?, CompletionStatus::Pending);
        assert!(source.try_set_result(42));
        assert_eq!(c.status()?, CompletionStatus::Succeeded);
        assert!(!source.try_set_result(43));

        assert_eq!(c.result()?, 42);
        assert!(matches!(
            source.consume(token),
            Err(Error::InvalidState {
                status: Status::Consumed,
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn consume_before_completion_is_invalid() -> Result<()> {
        let source = CompletionSource::<u8>::new();
        let c = source.arm(None, None)?;

        assert!(matches!(
            source.consume(c.token()),
            Err(Error::InvalidState {
                op: "consume",
                status: Status::Armed
            })
        ));

        Ok(())
    }

    #[test]
    fn sequencing_misuse() -> Result<()> {
        let source = CompletionSource::<u8>::new();

        assert!(!source.try_set_result(1), "idle source cannot complete");

        let c = source.arm(None, None)?;
        assert!(matches!(
            source.arm(None, None),
            Err(Error::InvalidState {
                op: "arm",
                status: Status::Armed
            })
        ));
        assert!(matches!(
            source.reset(),
            Err(Error::InvalidState {
                op: "reset",
                status: Status::Armed
            })
        ));

        source.try_set_result(1);
        assert!(matches!(
            source.reset(),
            Err(Error::InvalidState {
                status: Status::Completed,
                ..
            })
        ));

        c.result()?;
        source.reset()?;
        Ok(())
    }

    #[test]
    fn reset_isolates_generations() -> Result<()> {
        let source = CompletionSource::new();
        let old = source.arm(None, None)?;
        let old_token = old.token();

        source.try_set_result(1);
        assert_eq!(old.result()?, 1);
        let new_token = source.reset()?;
        assert_ne!(old_token, new_token);

        let fresh = source.arm(None, None)?;
        assert_eq!(fresh.token(), new_token);
        assert_eq!(fresh.status()?, CompletionStatus::Pending);

        assert!(matches!(
            source.status(old_token),
            Err(Error::InvalidToken { .. })
        ));
        assert!(matches!(
            source.consume(old_token),
            Err(Error::InvalidToken { .. })
        ));

        Ok(())
    }

    #[test]
    fn stale_token_completion_is_rejected() -> Result<()> {
        let source = CompletionSource::new();
        let first = source.arm(None, None)?.token();
        source.try_set_result(1);
        source.consume(first)?;
        source.reset()?;

        let c = source.arm(None, None)?;
        assert!(!source.completer().with_token(first).set_result(99));
        assert_eq!(c.status()?, CompletionStatus::Pending);
        assert_eq!(source.lifecycle(), Status::Armed);

        assert!(source.completer().with_token(c.token()).set_result(7));
        assert_eq!(c.result()?, 7);
        Ok(())
    }

    #[test]
    fn fault_and_cancel_classification() -> Result<()> {
        let source = CompletionSource::<u32>::new();

        let c = source.arm(None, None)?;
        source.try_set_error(io::Error::other("broken pipe").into());
        assert_eq!(c.status()?, CompletionStatus::Faulted);
        assert!(matches!(c.result(), Err(Error::Faulted(_))));
        source.reset()?;

        let c = source.arm(None, None)?;
        source.try_set_error(Error::Canceled(CancelCause::new("nope")));
        assert_eq!(c.status()?, CompletionStatus::Canceled);
        match c.result() {
            Err(Error::Canceled(cause)) => assert_eq!(cause.reason(), "nope"),
            r => panic!("unexpected {r:?}"),
        }
        source.reset()?;

        let c = source.arm(None, None)?;
        source.try_set_canceled("stop");
        assert_eq!(c.status()?, CompletionStatus::Canceled);
        assert!(c.result().unwrap_err().is_canceled());

        Ok(())
    }

    #[test]
    fn timeout_default_is_timed_out_fault() -> Result<()> {
        init();
        let source = CompletionSource::<u32>::new();
        let c = source.arm(Some(Duration::from_millis(1)), None)?;

        match c.wait() {
            Err(Error::TimedOut(d)) => assert_eq!(d, Duration::from_millis(1)),
            r => panic!("unexpected {r:?}"),
        }

        Ok(())
    }

    #[test]
    fn timeout_status_is_faulted() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(Some(Duration::from_millis(1)), None)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while c.status()? == CompletionStatus::Pending {
            assert!(Instant::now() < deadline, "timeout never fired");
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(c.status()?, CompletionStatus::Faulted);
        assert!(!source.completer().with_token(c.token()).set_result(4));
        assert!(c.result().unwrap_err().is_timeout());
        Ok(())
    }

    #[test]
    fn manual_completion_disarms_timeout() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(Some(Duration::from_millis(20)), None)?;

        assert!(source.try_set_result(5));
        thread::sleep(Duration::from_millis(60));

        assert_eq!(c.status()?, CompletionStatus::Succeeded);
        assert_eq!(c.result()?, 5);
        Ok(())
    }

    #[test]
    fn unbounded_timeout_waits_for_manual_completion() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(Some(Duration::MAX), None)?;

        assert_eq!(c.status()?, CompletionStatus::Pending);
        assert!(source.try_set_result(8));
        assert_eq!(c.result()?, 8);

        source.reset()?;
        Ok(())
    }

    #[test]
    fn old_timeout_does_not_reach_next_generation() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(Some(Duration::from_millis(10)), None)?;

        assert!(source.try_set_result(1));
        assert_eq!(c.result()?, 1);
        source.reset()?;

        let next = source.arm(None, None)?;
        thread::sleep(Duration::from_millis(50));

        assert_eq!(next.status()?, CompletionStatus::Pending);
        assert!(source.try_set_result(2));
        assert_eq!(next.result()?, 2);
        Ok(())
    }

    /// Parks the timeout between the lock-free check and the locked
    /// transition until the test releases it.
    struct Stalled {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl Hooks<u32> for Stalled {
        type Data = ();

        fn on_timeout(&self, after: Duration) -> Outcome<u32> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Outcome::Fault(Error::TimedOut(after))
        }
    }

    #[test]
    fn manual_completion_beats_timeout_in_flight() -> Result<()> {
        let (entered_tx, entered) = channel();
        let (release, release_rx) = channel();
        let source = CompletionSource::with_hooks(Stalled {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let c = source.arm(Some(Duration::from_millis(1)), None)?;

        entered.recv_timeout(Duration::from_secs(5))?;

        // Disarming waits for the stalled timer callback, so complete from
        // another thread and release the timeout once the manual side won.
        let manual = {
            let source = source.clone();
            thread::spawn(move || source.try_set_result(4))
        };
        while source.lifecycle() != Status::Completed {
            thread::yield_now();
        }
        release.send(())?;

        assert!(manual.join().unwrap());
        assert_eq!(c.status()?, CompletionStatus::Succeeded);
        assert_eq!(c.result()?, 4);
        Ok(())
    }

    #[test]
    fn timeout_continuation_leaves_timer_thread() -> Result<()> {
        let first = CompletionSource::<u32>::new();
        let second = CompletionSource::<u32>::new();
        let c1 = first.arm(Some(Duration::from_millis(30)), None)?;
        let c2 = second.arm(Some(Duration::from_millis(80)), None)?;
        let (tx, rx) = channel();

        // Blocking here would stall every timer if it ran on the timer thread.
        c1.on_completed(
            move || {
                let name = thread::current().name().map(String::from);
                tx.send((name, c2.wait().unwrap_err().is_timeout())).unwrap();
            },
            ContinuationFlags::NONE,
        )?;

        let (name, timed_out) = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(name.as_deref(), Some("rearm-dispatch"));
        assert!(timed_out);
        Ok(())
    }

    #[test]
    fn cancellation_completes_as_canceled() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let token = CancellationToken::new();
        let c = source.arm(None, Some(&token))?;

        token.cancel("user hit ctrl-c");

        assert_eq!(c.status()?, CompletionStatus::Canceled);
        assert!(!source.try_set_result(1));
        match c.result() {
            Err(Error::Canceled(cause)) => assert_eq!(cause.reason(), "user hit ctrl-c"),
            r => panic!("unexpected {r:?}"),
        }

        Ok(())
    }

    #[test]
    fn precanceled_token_completes_during_arm() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let token = CancellationToken::new();
        token.cancel("already");

        let c = source.arm(Some(Duration::from_millis(5)), Some(&token))?;
        assert_eq!(c.status()?, CompletionStatus::Canceled);
        assert!(!source.try_set_result(1));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(c.status()?, CompletionStatus::Canceled);
        Ok(())
    }

    #[test]
    fn cancellation_after_completion_is_noop() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let token = CancellationToken::new();
        let c = source.arm(None, Some(&token))?;

        assert!(source.try_set_result(3));
        token.cancel("late");

        assert_eq!(c.result()?, 3);
        Ok(())
    }

    struct Custom;

    impl Hooks<u32> for Custom {
        type Data = &'static str;

        fn on_timeout(&self, _after: Duration) -> Outcome<u32> {
            Outcome::Success(0)
        }

        fn on_canceled(&self, cause: CancelCause) -> Outcome<u32> {
            Outcome::Fault(Error::faulted(io::Error::other(cause.to_string())))
        }
    }

    #[test]
    fn policy_overrides() -> Result<()> {
        let source = CompletionSource::with_hooks(Custom);

        let c = source.arm(Some(Duration::ZERO), None)?;
        assert_eq!(c.wait()?, 0);
        source.reset()?;

        let token = CancellationToken::new();
        let c = source.arm(None, Some(&token))?;
        token.cancel("converted");
        assert_eq!(c.status()?, CompletionStatus::Faulted);
        assert_eq!(
            c.result().unwrap_err().to_string(),
            "operation faulted: converted"
        );

        Ok(())
    }

    #[derive(Default)]
    struct Recording {
        consumed: Mutex<Vec<Option<u32>>>,
    }

    impl Hooks<String> for Recording {
        type Data = u32;

        fn on_consumed(&self, source: &Arc<CompletionSource<String, Self>>, data: Option<u32>) {
            self.consumed.lock().unwrap().push(data);
            source.reset().unwrap();
        }
    }

    #[test]
    fn consumption_hook_receives_data_and_may_reset() -> Result<()> {
        let source = CompletionSource::with_hooks(Recording::default());

        let c = source.arm(None, None)?;
        assert!(source.completer().with_data(7).set_result("a".into()));
        assert_eq!(c.result()?, "a");
        assert_eq!(source.lifecycle(), Status::Idle);

        let c = source.arm(None, None)?;
        assert!(source.try_set_result("b".into()));
        assert!(!source.completer().with_data(9).set_result("lost".into()));
        assert_eq!(c.result()?, "b");

        assert_eq!(*source.hooks().consumed.lock().unwrap(), vec![Some(7), None]);
        Ok(())
    }

    #[test]
    fn continuation_runs_once_after_completion() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(None, None)?;
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = hits.clone();
            c.on_completed(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                ContinuationFlags::NONE,
            )?;
        }

        assert!(matches!(
            c.on_completed(|| {}, ContinuationFlags::NONE),
            Err(Error::InvalidState { .. })
        ));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        source.try_set_result(1);
        source.try_set_result(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        Ok(())
    }

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn callback_cannot_displace_awaiting_task() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let mut c = source.arm(None, None)?;
        let wakes = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(wakes.clone());
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut c).poll(&mut cx).is_pending());

        assert!(matches!(
            source.on_completed(c.token(), || {}, ContinuationFlags::NONE),
            Err(Error::InvalidState {
                status: Status::Armed,
                ..
            })
        ));
        assert!(matches!(
            LinkedBridge::link(&source),
            Err(Error::InvalidState { .. })
        ));

        assert!(source.try_set_result(1));
        assert_eq!(wakes.0.load(Ordering::SeqCst), 1);

        match Pin::new(&mut c).poll(&mut cx) {
            Poll::Ready(r) => assert_eq!(r?, 1),
            Poll::Pending => panic!("completed generation still pending"),
        }
        Ok(())
    }

    #[test]
    fn continuation_after_completion_runs_immediately() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(None, None)?;
        source.try_set_result(1);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        c.on_completed(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            ContinuationFlags::NONE,
        )?;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn continuation_may_reenter_source() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(None, None)?;
        let (tx, rx) = channel();

        {
            let source = source.clone();
            let token = c.token();
            c.on_completed(
                move || {
                    tx.send(source.consume(token).unwrap()).unwrap();
                    source.reset().unwrap();
                },
                ContinuationFlags::NONE,
            )?;
        }

        assert!(source.try_set_result(11));
        assert_eq!(rx.try_recv()?, 11);
        assert_eq!(source.lifecycle(), Status::Idle);
        Ok(())
    }

    #[test]
    fn deferred_continuations_leave_completing_thread() -> Result<()> {
        let source = CompletionSource::<u32>::with_options(
            Default::default(),
            SourceOptions::new().deferred_continuations(true).label("deferred"),
        );
        let c = source.arm(None, None)?;
        let (tx, rx) = channel();

        c.on_completed(
            move || tx.send(thread::current().id()).unwrap(),
            ContinuationFlags::NONE,
        )?;
        source.try_set_result(1);

        assert_ne!(rx.recv_timeout(Duration::from_secs(5))?, thread::current().id());
        Ok(())
    }

    #[test]
    fn first_writer_wins() -> Result<()> {
        init();
        const THREADS: usize = 8;
        let source = CompletionSource::<usize>::new();

        for _ in 0..200 {
            let token = CancellationToken::new();
            let c = source.arm(Some(Duration::from_micros(50)), Some(&token))?;
            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let workers: Vec<_> = (0..THREADS)
                .map(|i| {
                    let source = source.clone();
                    let barrier = barrier.clone();
                    let token = token.clone();
                    let t = c.token();
                    thread::spawn(move || {
                        barrier.wait();
                        match i % 4 {
                            0 => source.completer().with_token(t).set_result(i),
                            1 => source.try_set_error(io::Error::other(format!("{i}")).into()),
                            2 => source.try_set_canceled(format!("{i}")),
                            _ => {
                                token.cancel(format!("{i}"));
                                false
                            }
                        }
                    })
                })
                .collect();

            barrier.wait();
            let manual_wins = workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|won| *won)
                .count();

            assert!(manual_wins <= 1);

            let generation = c.token();
            let result = c.wait();
            let observed = source.status(generation)?;
            match &result {
                Ok(_) => assert_eq!(observed, CompletionStatus::Succeeded),
                Err(Error::Canceled(_)) => assert_eq!(observed, CompletionStatus::Canceled),
                Err(_) => assert_eq!(observed, CompletionStatus::Faulted),
            }

            source.reset()?;
        }

        Ok(())
    }

    #[test]
    fn exactly_one_completer_wins() -> Result<()> {
        const THREADS: usize = 6;
        let source = CompletionSource::<usize>::new();

        for _ in 0..200 {
            let c = source.arm(None, None)?;
            let barrier = Arc::new(Barrier::new(THREADS));

            let workers: Vec<_> = (0..THREADS)
                .map(|i| {
                    let source = source.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        (i, source.try_set_result(i))
                    })
                })
                .collect();

            let winners: Vec<_> = workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|(_, won)| *won)
                .collect();

            assert_eq!(winners.len(), 1);
            assert_eq!(c.result()?, winners[0].0);
            source.reset()?;
        }

        Ok(())
    }

    #[test]
    fn await_from_task() -> Result<()> {
        let source = CompletionSource::<&'static str>::new();
        let c = source.arm(None, None)?;

        let producer = {
            let source = source.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                source.try_set_result("hello")
            })
        };

        let v = Executor::block_on(c);
        assert!(producer.join().unwrap());
        assert_eq!(v?, "hello");
        Ok(())
    }

    #[test]
    fn polling_stale_handle_errors() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(None, None)?;
        source.try_set_result(1);
        source.consume(c.token())?;
        source.reset()?;

        assert!(matches!(
            Executor::block_on(c),
            Err(Error::InvalidToken { .. })
        ));
        Ok(())
    }

    #[test]
    fn scenario_infinite_timeout() -> Result<()> {
        let source = CompletionSource::<u32>::new();
        let c = source.arm(None, None)?;
        let token = c.token();

        assert!(source.try_set_result(42));
        assert_eq!(c.status()?, CompletionStatus::Succeeded);
        assert_eq!(source.consume(token)?, 42);

        assert!(!source.completer().with_token(token).set_result(43));
        assert!(matches!(
            source.consume(token),
            Err(Error::InvalidState { .. })
        ));

        Ok(())
    }
}
