//! Future sub-modules.
//!
//! The `futures` module collects the user-facing futures built on top of
//! [CompletionSource](crate::source::CompletionSource). The source itself, and
//! the [Completion](crate::source::Completion) handle it hands out, live in the
//! [source](crate::source) module; everything here either adapts a source to
//! another style of API or uses one internally.
//!
//! The following sub-modules are exposed by the `futures` module:
//!
//! - `bridge`: Links one generation of a source to a conventional promise.
//! - `promise`: A single-use promise, for producers that cannot speak the
//!   source protocol directly.
//! - `timer`: Puts tasks to sleep using the crate's timer thread.
pub mod bridge;
pub mod promise;
pub mod timer;
