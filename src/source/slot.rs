use crate::{cancel::CancelCause, error::Error};

/// What a handle observes about its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Succeeded,
    Canceled,
    Faulted,
}

/// A classified completion result.
///
/// The classification is decided once, when the outcome is produced, so that
/// the status reported before consumption always agrees with the error
/// returned by consumption.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Canceled(CancelCause),
    Fault(Error),
}

impl<T> Outcome<T> {
    /// Classify a result. A cancellation error becomes [Outcome::Canceled],
    /// every other error becomes [Outcome::Fault].
    pub fn from_result(result: Result<T, Error>) -> Self {
        match result {
            Ok(v) => Self::Success(v),
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(e: Error) -> Self {
        match e {
            Error::Canceled(cause) => Self::Canceled(cause),
            e => Self::Fault(e),
        }
    }

    pub fn status(&self) -> CompletionStatus {
        match self {
            Outcome::Success(_) => CompletionStatus::Succeeded,
            Outcome::Canceled(_) => CompletionStatus::Canceled,
            Outcome::Fault(_) => CompletionStatus::Faulted,
        }
    }

    /// Extract the value or re-raise the stored failure.
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::Canceled(cause) => Err(Error::Canceled(cause)),
            Outcome::Fault(e) => Err(e),
        }
    }
}

/// Storage for the outcome of the current generation.
///
/// The classification outlives the value: after the outcome has been taken
/// out, [ResultSlot::status] keeps reporting what it was until the slot is
/// cleared.
#[derive(Debug)]
pub(crate) struct ResultSlot<T> {
    outcome: Option<Outcome<T>>,
    status: CompletionStatus,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            outcome: None,
            status: CompletionStatus::Pending,
        }
    }

    pub fn set(&mut self, outcome: Outcome<T>) {
        debug_assert!(self.outcome.is_none(), "result slot written twice");
        self.status = outcome.status();
        self.outcome = Some(outcome);
    }

    pub fn take(&mut self) -> Option<Outcome<T>> {
        self.outcome.take()
    }

    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    /// `true` once an outcome has been stored, even if it was taken since.
    pub fn is_set(&self) -> bool {
        self.status != CompletionStatus::Pending
    }

    pub fn clear(&mut self) {
        self.outcome = None;
        self.status = CompletionStatus::Pending;
    }
}
