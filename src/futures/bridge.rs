//! Bridging completion sources to promises.
//!
//! Some producers cannot drive a [CompletionSource] themselves; they only know
//! how to hand out a conventional [Promise]. [LinkedBridge] connects the two:
//! it registers a one-shot continuation on one generation of a source and,
//! when that fires, consumes the result and applies it to a freshly allocated
//! promise.
//!
//! The bridge's only reference to the source lives inside that continuation,
//! so it is released as soon as the result has been transferred. A pooled
//! source is therefore never kept alive by a promise that outlives it.
//!
//! # Example
//!
//! ```
//! use rearm::futures::bridge::LinkedBridge;
//! use rearm::source::{CompletionSource, CompletionStatus};
//!
//! let source = CompletionSource::<u32>::new();
//! let completion = source.arm(None, None).unwrap();
//! let promise = completion.into_promise().unwrap();
//!
//! source.try_set_canceled("no longer needed");
//!
//! assert_eq!(promise.status(), CompletionStatus::Canceled);
//! ```
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use log::debug;
use thiserror::Error;

use super::promise::Promise;
use crate::{
    error::{Error, Result},
    source::{Completion, CompletionSource, ContinuationFlags, Hooks},
};

/// Raised on the bridged promise when transferring the result panicked.
#[derive(Debug, Error)]
#[error("result transfer panicked: {0}")]
pub struct TransferPanic(String);

impl TransferPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());

        Self(msg)
    }
}

/// A one-shot continuation that moves one generation's result into a
/// [Promise].
pub struct LinkedBridge<T, H: Hooks<T>> {
    completion: Completion<T, H>,
    promise: Promise<T>,
}

impl<T: Send + 'static, H: Hooks<T>> LinkedBridge<T, H> {
    /// Link the current generation of `source` to a new promise.
    pub fn link(source: &Arc<CompletionSource<T, H>>) -> Result<Promise<T>> {
        Self::link_completion(Completion {
            source: source.clone(),
            token: source.token(),
        })
    }

    /// Link the generation of `completion` to a new promise.
    ///
    /// Fails if `completion` is stale or already has a continuation attached.
    pub fn link_completion(completion: Completion<T, H>) -> Result<Promise<T>> {
        let promise = Promise::new();
        let source = completion.source.clone();
        let token = completion.token;

        let bridge = LinkedBridge {
            completion,
            promise: promise.clone(),
        };

        source.on_completed(token, move || bridge.fire(), ContinuationFlags::NONE)?;

        Ok(promise)
    }

    fn fire(self) {
        let LinkedBridge {
            completion,
            promise,
        } = self;

        let token = completion.token();
        let result = catch_unwind(AssertUnwindSafe(move || completion.result()));

        match result {
            Ok(Ok(v)) => {
                promise.try_set_result(v);
            }
            Ok(Err(Error::Canceled(cause))) => {
                promise.try_set_canceled(cause);
            }
            Ok(Err(e)) => {
                if e.is_misuse() {
                    debug!("bridge for {token} could not take result: {e}");
                }
                promise.try_set_error(e);
            }
            Err(payload) => {
                let e = TransferPanic::from_payload(payload);
                debug!("bridge for {token}: {e}");
                promise.try_set_error(Error::faulted(e));
            }
        }
    }
}

impl<T: Send + 'static, H: Hooks<T>> Completion<T, H> {
    /// Hand this completion's result to a conventional [Promise].
    ///
    /// See [LinkedBridge].
    pub fn into_promise(self) -> Result<Promise<T>> {
        LinkedBridge::link_completion(self)
    }
}
