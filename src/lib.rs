//! # `rearm`: resettable completion sources
//!
//! This crate implements a *poolable* asynchronous completion primitive: a
//! producer/consumer future whose storage is reused across many logical
//! operations instead of being allocated per operation. A single
//! [CompletionSource](source::CompletionSource) is armed, completed, consumed
//! and reset over and over again, and a generation [Token](source::Token)
//! makes sure a handle from an earlier cycle can never observe or disturb a
//! later one.
//!
//! Completion may race in from any thread: a producer, the timeout timer, or a
//! [CancellationToken](cancel::CancellationToken). Exactly one wins per
//! generation. Continuations are never run while the source's internal lock is
//! held.
//!
//! For the state machine itself refer to the [source] module. Adapters to
//! conventional promises and a timer future live in [futures], and [task]
//! provides a tiny executor to `.await` completions with.
//!
//! ## Example
//!
//! A source reused for two operations, the second of which times out:
//!
//! ```
//! use rearm::error::Error;
//! use rearm::source::CompletionSource;
//! use rearm::task::Executor;
//! use std::time::Duration;
//!
//! let source = CompletionSource::<&str>::new();
//!
//! let op = source.arm(None, None).unwrap();
//! source.try_set_result("first");
//! assert_eq!(Executor::block_on(op).unwrap(), "first");
//!
//! source.reset().unwrap();
//!
//! let op = source.arm(Some(Duration::from_millis(10)), None).unwrap();
//! assert!(matches!(Executor::block_on(op), Err(Error::TimedOut(_))));
//! ```
pub mod cancel;
pub mod error;
pub mod futures;
pub(crate) mod reactor;
pub mod source;
pub mod task;
