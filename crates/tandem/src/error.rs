//! Error taxonomy shared by completions, tasks, primitives and combinators.
//!
//! Every failure a caller can observe is a variant of [`Error`], so code can
//! branch on cancellation, timeout and application errors without looking at
//! message text.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the runtime, or carried through it from a computation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The completion is still pending
    #[error("result is not ready")]
    NotReady,

    /// The operation ended through cancellation
    #[error("operation was cancelled")]
    Cancelled,

    /// A combinator deadline elapsed first
    #[error("operation timed out")]
    TimedOut,

    /// A bounded semaphore was released more times than it was acquired
    #[error("bounded semaphore released too many times")]
    OverReleased,

    /// A completion was resolved a second time
    #[error("completion is already resolved")]
    AlreadyResolved,

    /// Release of a lock that is not held
    #[error("lock is not acquired")]
    NotLocked,

    /// Release of a reentrant lock by a task that does not own it
    #[error("lock is owned by another task")]
    NotOwner,

    /// Nothing runnable, no timer armed and no worker job outstanding
    #[error("scheduler stalled with {pending} task(s) that can never be resumed")]
    Stalled {
        /// Number of live tasks left suspended
        pending: usize,
    },

    /// A task, callback or worker job panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// The worker pool no longer accepts jobs
    #[error("worker pool is shut down")]
    PoolClosed,

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Application error produced by a computation
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl Error {
    /// Build an application error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this error is a combinator timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Downcast an application error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Error::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Convert a caught panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Error::Panicked(panic_message(payload.as_ref()))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(err) => Error::Failed(Arc::new(err)),
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
