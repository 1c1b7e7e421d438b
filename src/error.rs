//! Errors.
//!
//! Every fallible operation in `rearm` returns [Error]. Two of its variants
//! report *misuse* of a source ([Error::InvalidState] and
//! [Error::InvalidToken]); these are returned synchronously to the caller that
//! made the mistake. The remaining variants describe how an operation
//! *finished*: they are stored by the producer and only surface when the
//! result is consumed.
use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{cancel::CancelCause, source::Status, source::Token};

/// The error type for all `rearm` operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An operation was called out of sequence, e.g. arming a source that is
    /// already armed or consuming a result twice.
    #[error("cannot {op} a source that is {status}")]
    InvalidState { op: &'static str, status: Status },

    /// A handle from another generation was used.
    #[error("token {token} does not match current generation {current}")]
    InvalidToken { token: Token, current: Token },

    /// The operation was canceled.
    #[error("operation canceled: {0}")]
    Canceled(CancelCause),

    /// The operation did not complete before its deadline.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The producer failed.
    #[error("operation faulted: {0}")]
    Faulted(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary producer error as [Error::Faulted].
    pub fn faulted(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Faulted(Arc::new(e))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Returns `true` for errors caused by calling an operation out of
    /// sequence or with a stale token.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::InvalidToken { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::faulted(value)
    }
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
