//! Error types for address resolution, option application and opening.
//!
//! Errors fall into two classes. Configuration errors are detected before
//! any resource is acquired; resource errors happen inside an address's open
//! entry point, after which everything acquired so far has been released.

use std::io;

use thiserror::Error;

/// Failure to resolve or open an address.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The address text could not be split into type, arguments and options.
    #[error("malformed address \"{0}\"")]
    Syntax(String),

    /// No registry entry has this name.
    #[error("unknown address type \"{0}\"")]
    UnknownAddress(String),

    /// Positional argument count outside the descriptor's bounds.
    #[error("{address}: {given} parameter(s) given, {expected} required")]
    Arity {
        /// Address type name.
        address: String,
        /// Number of positional arguments supplied.
        given: usize,
        /// Human-readable expected range.
        expected: String,
    },

    /// The requested direction is not supported by the address type.
    #[error("{address}: cannot be opened {requested}")]
    Direction {
        /// Address type name.
        address: String,
        /// Requested direction, e.g. "read-only".
        requested: &'static str,
    },

    /// No option with this name exists.
    #[error("unknown option \"{0}\"")]
    UnknownOption(String),

    /// The option exists but cannot be applied to this address (wrong group,
    /// or its phase was never reached).
    #[error("option \"{option}\" is not applicable to address {address}")]
    NotApplicable {
        /// Option name as given.
        option: String,
        /// Address type name.
        address: String,
    },

    /// The option value did not parse as the option's type.
    #[error("option \"{option}\": {reason}")]
    TypeMismatch {
        /// Option name as given.
        option: String,
        /// What was wrong with the value.
        reason: String,
    },

    /// An echo-suppression pattern failed to compile.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A system call failed while acquiring resources.
    #[error("{context}: {source}")]
    Resource {
        /// What was being done.
        context: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

impl OpenError {
    /// Builds a [`OpenError::Resource`] from an I/O error.
    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// True for errors detected before any resource was touched.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::Pattern(_) | Self::Resource { .. })
    }
}

/// Extension trait attaching context to `io::Result`s inside open entry points.
pub(crate) trait IoContext<T> {
    /// Maps the error into [`OpenError::Resource`] with a lazily built context.
    fn open_context<F, C>(self, context: F) -> Result<T, OpenError>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn open_context<F, C>(self, context: F) -> Result<T, OpenError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| OpenError::resource(context(), e))
    }
}
