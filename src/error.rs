//! Error type shared by every fallible operation of the engine.

use thiserror::Error;

/// Errors raised by function construction, evaluation, differentiation and
/// code generation.
///
/// Every surfaced error aborts the current request; nothing is partially
/// written back to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// An input or output index outside `[0, len)`.
    #[error("In function {function}: {io} {index} not in interval [0, {len})")]
    IndexOutOfRange {
        function: String,
        io: &'static str,
        index: usize,
        len: usize,
    },

    /// A name lookup (scheme entry, option, statistic, compiler plugin) failed.
    #[error("{context}: could not find entry \"{name}\". Available names are: {}", .available.join(", "))]
    NotFound {
        context: String,
        name: String,
        available: Vec<String>,
    },

    /// The concrete function kind lacks the requested capability.
    #[error("In function {function}: '{operation}' is not supported")]
    UnsupportedOperation { function: String, operation: String },

    /// Declared and supplied shapes or sparsity patterns disagree.
    #[error("In function {function}: inconsistent dimensions, {message}")]
    InconsistentDimension { function: String, message: String },

    /// A non-finite value was produced or supplied while checking was enabled.
    #[error("In function {function}: non-finite value in {location}")]
    RegularityViolation { function: String, location: String },

    /// A weak cache slot no longer resolves. Handled internally by rebuilding.
    #[error("cached function has expired")]
    Expired,

    /// The function was used before `init()`.
    #[error("function {function} has not been initialized")]
    NotInitialized { function: String },

    /// An argument or option value is out of its valid domain.
    #[error("In function {function}: {message}")]
    InvalidArgument { function: String, message: String },

    /// A compiled module returned a nonzero status code.
    #[error("In function {function}: evaluation failed with return code {code}")]
    Evaluation { function: String, code: i32 },

    /// A compiler plugin failed to produce a module.
    #[error("compiler plugin '{plugin}' failed: {message}")]
    Compilation { plugin: String, message: String },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unsupported(function: &str, operation: &str) -> Self {
        Error::UnsupportedOperation {
            function: function.to_string(),
            operation: operation.to_string(),
        }
    }

    pub(crate) fn dimension(function: &str, message: impl Into<String>) -> Self {
        Error::InconsistentDimension {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid(function: &str, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(context: impl Into<String>, name: &str, available: Vec<String>) -> Self {
        Error::NotFound {
            context: context.into(),
            name: name.to_string(),
            available,
        }
    }
}
