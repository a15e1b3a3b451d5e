//! Error types.

use std::fmt::Display;

use snafu::Snafu;

/// A generic, type-erased error.
///
/// Used for errors produced by application callbacks and services, where the worker only needs to report the error and
/// hand it to the reload trigger, rather than match on it.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// Accepts a string literal, a format string with arguments, or an existing error value, in the same way as
/// `std::format!`.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::error::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::error::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::error::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to fallible results.
///
/// Named distinctly from `snafu::ResultExt` so that both can be imported in the same module.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context that is only evaluated once an error occurs.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

/// Worker lifecycle errors.
///
/// These are the fatal errors of the worker lifecycle: they are not recovered by the worker itself and propagate to
/// the top-level startup path of the process.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum WorkerError {
    /// The runtime backing the event loop could not be built.
    #[snafu(display("Failed to build event loop runtime for worker '{}': {}", worker_name, source))]
    RuntimeBuild {
        /// Name of the worker.
        worker_name: String,

        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The worker was asked to run when it was not in the `Created` state.
    #[snafu(display("Worker '{}' cannot be run from state {:?}.", worker_name, state))]
    AlreadyStarted {
        /// Name of the worker.
        worker_name: String,

        /// State the worker was in.
        state: crate::worker::LifecycleState,
    },
}
