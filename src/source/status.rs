use std::fmt::{self, Display};

use crate::error::Error;

/// Identifies one arming cycle of a [CompletionSource](super::CompletionSource).
///
/// Every handle carries the token it was created for. Once the source has been
/// reset, all tokens handed out before the reset are permanently invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub(crate) u64);

impl Token {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a source within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not armed. Both the initial state and the state after a reset.
    Idle,
    /// Armed and waiting for a completion.
    Armed,
    /// A completion won the race; the result is waiting to be consumed.
    Completed,
    /// The result has been taken out. Only [reset](super::CompletionSource::reset)
    /// is legal from here.
    Consumed,
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Idle => "idle",
            Status::Armed => "armed",
            Status::Completed => "completed",
            Status::Consumed => "consumed",
        })
    }
}

/// Generation counter plus lifecycle status.
///
/// Only ever mutated while the owning source's lock is held.
#[derive(Debug)]
pub(crate) struct VersionedStatus {
    generation: u64,
    status: Status,
}

impl VersionedStatus {
    pub fn new() -> Self {
        Self {
            generation: 0,
            status: Status::Idle,
        }
    }

    pub fn token(&self) -> Token {
        Token(self.generation)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn check_token(&self, token: Token) -> Result<(), Error> {
        if token.0 != self.generation {
            return Err(Error::InvalidToken {
                token,
                current: self.token(),
            });
        }

        Ok(())
    }

    /// Move from `from` to `to`, provided the generation matches `token` (when
    /// one is given) and the current status is `from`.
    pub fn transition(
        &mut self,
        op: &'static str,
        token: Option<Token>,
        from: Status,
        to: Status,
    ) -> Result<Token, Error> {
        if let Some(token) = token {
            self.check_token(token)?;
        }

        if self.status != from {
            return Err(Error::InvalidState {
                op,
                status: self.status,
            });
        }

        self.status = to;

        Ok(self.token())
    }

    /// Return to [Status::Idle] under a fresh generation.
    pub fn advance(&mut self) -> Token {
        self.generation = self.generation.wrapping_add(1);
        self.status = Status::Idle;
        self.token()
    }
}
