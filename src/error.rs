//! Error types for the harness
//!
//! Every failure the harness can surface at a waiting call site is an [`Error`].
//! Failures raised by loop-scheduled work keep their original payload inside a
//! [`Failure`], so a test can recover exactly what was raised.

use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned from a fallible test body
pub type BoxError = Box<dyn std::error::Error + Send + 'static>;

/// Payload carried by a caught panic
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Main error type for harness operations
#[derive(Error, Debug)]
pub enum Error {
    /// The resolved deadline elapsed before the awaited stop or completion
    #[error("Async operation timed out after {0:?}")]
    Timeout(Duration),

    /// Work executed by the event loop failed; the original payload is preserved
    #[error("Callback failed: {0}")]
    Callback(Failure),

    /// A test's completion marker was not reached by teardown time
    #[error("Test did not reach its completion marker `{marker}`")]
    Incomplete {
        /// Name of the marker that was never finished
        marker: String,
    },

    /// An override value could not be used as a timeout
    #[error("Invalid timeout override {key}={value:?}: {reason}")]
    Configuration {
        /// Configuration key that was read
        key: String,
        /// Raw value found under the key
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Event loop misuse
    #[error("Runtime error: {reason}")]
    RuntimeError {
        /// Reason for the runtime error
        reason: String,
    },
}

impl Error {
    /// Whether this is a [`Error::Timeout`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// The captured callback failure, if this error carries one
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Callback(failure) => Some(failure),
            _ => None,
        }
    }

    /// Re-raise this error on the current thread.
    ///
    /// Panics caught inside loop callbacks resume with their original payload;
    /// everything else panics with the error's message.
    pub fn raise(self) -> ! {
        match self {
            Error::Callback(failure) => failure.resume(),
            other => panic!("{}", other),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::Callback(failure)
    }
}

/// Something raised by work the harness ran on the test's behalf
pub enum Failure {
    /// A panic, with the payload exactly as it was raised
    Panic(PanicPayload),
    /// An error returned from a fallible test body
    Error(BoxError),
}

impl Failure {
    /// Wrap any error value
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + 'static,
    {
        Failure::Error(Box::new(err))
    }

    /// Whether this failure came from a panic
    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panic(_))
    }

    /// Downcast a panic payload to its concrete type
    pub fn payload<P: Any>(&self) -> Option<&P> {
        match self {
            Failure::Panic(payload) => payload.downcast_ref::<P>(),
            Failure::Error(_) => None,
        }
    }

    /// Downcast a returned error to its concrete type
    pub fn error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Failure::Error(err) => err.downcast_ref::<E>(),
            Failure::Panic(_) => None,
        }
    }

    /// Human-readable message for the failure
    pub fn message(&self) -> String {
        match self {
            Failure::Panic(payload) => panic_message(payload)
                .unwrap_or("<non-string panic payload>")
                .to_string(),
            Failure::Error(err) => err.to_string(),
        }
    }

    /// Resume unwinding with the original payload
    pub fn resume(self) -> ! {
        match self {
            Failure::Panic(payload) => std::panic::resume_unwind(payload),
            Failure::Error(err) => panic!("{}", err),
        }
    }
}

/// Extract the message of a `panic!` payload, if it is a string
pub fn panic_message(payload: &PanicPayload) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some(s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(_) => f.debug_tuple("Panic").field(&self.message()).finish(),
            Failure::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panic(_) => write!(f, "panicked: {}", self.message()),
            Failure::Error(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Failure::Error(err) => Some(&**err),
            Failure::Panic(_) => None,
        }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
