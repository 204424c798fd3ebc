use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

use crate::TimedFuture;

/// Why a [`TimedFuture`] resolved without a value.
///
/// The first three variants are produced by this crate and can be matched by kind. Errors
/// returned by the operation itself are carried verbatim in [`FutureError::Failed`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum FutureError<E> {
    /// The timeout elapsed before the operation returned.
    #[error("future timed out")]
    TimedOut,

    /// [`TimedFuture::kill()`] won the race against the operation and the timer.
    #[error("future was killed")]
    Killed,

    /// The operation panicked. The panic was caught on the runner thread.
    #[error("operation panicked: {message}")]
    Panicked {
        /// The panic message, if the payload was a string.
        message: String,
    },

    /// The operation returned an error.
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> FutureError<E> {
    /// Returns the operation's own error, if that is what this is.
    #[must_use]
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Returned by [`Executor::stop()`][crate::Executor::stop] when the executor was already stopped.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("executor already stopped")]
pub struct AlreadyStopped {
    _private: PhantomData<()>,
}

impl AlreadyStopped {
    pub(crate) fn new() -> Self {
        Self {
            _private: PhantomData,
        }
    }
}

/// Returned by [`Executor::get()`][crate::Executor::get] when fewer futures than requested
/// could be collected.
///
/// Futures that were collected before the failure are not lost; they are returned inside the
/// error and can be retrieved via [`GetError::collected()`] or [`GetError::into_collected()`].
#[derive(Error)]
#[non_exhaustive]
pub enum GetError<T, E> {
    /// The collection deadline elapsed.
    #[error("get timed out after collecting {} of {requested} futures", .collected.len())]
    TimedOut {
        /// How many futures the caller asked for.
        requested: usize,

        /// The futures received before the deadline.
        collected: Vec<TimedFuture<T, E>>,
    },

    /// The output stream was closed because the executor stopped and all in-flight futures
    /// have already been published.
    #[error("output stream closed after collecting {} of {requested} futures", .collected.len())]
    Closed {
        /// How many futures the caller asked for.
        requested: usize,

        /// The futures received before the stream closed.
        collected: Vec<TimedFuture<T, E>>,
    },
}

impl<T, E> GetError<T, E> {
    /// Whether the collection deadline elapsed (as opposed to the stream closing).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// How many futures were requested.
    #[must_use]
    pub fn requested(&self) -> usize {
        match self {
            Self::TimedOut { requested, .. } | Self::Closed { requested, .. } => *requested,
        }
    }

    /// The futures that were collected before the failure.
    #[must_use]
    pub fn collected(&self) -> &[TimedFuture<T, E>] {
        match self {
            Self::TimedOut { collected, .. } | Self::Closed { collected, .. } => collected,
        }
    }

    /// Consumes the error, returning the futures that were collected before the failure.
    #[must_use]
    pub fn into_collected(self) -> Vec<TimedFuture<T, E>> {
        match self {
            Self::TimedOut { collected, .. } | Self::Closed { collected, .. } => collected,
        }
    }
}

// Manual impl so that reporting a partial collection does not require `T: Debug`.
impl<T, E> fmt::Debug for GetError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.is_timeout() { "TimedOut" } else { "Closed" };

        f.debug_struct(name)
            .field("requested", &self.requested())
            .field("collected", &self.collected())
            .finish()
    }
}
