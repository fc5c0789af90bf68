//! Error types for tugboat operations
//!
//! Store failures are classified by what the caller can do about them
//! (`NotFound`, `AlreadyExists`, `Forbidden`, `Conflict`, everything else as
//! `Store`). Higher layers annotate errors with the object and operation via
//! [`ErrorContext`]; the classification helpers look through those wrappers.

use thiserror::Error;

/// Main error type for tugboat operations
#[derive(Debug, Error)]
pub enum Error {
    /// The addressed object does not exist in the store
    #[error("{key} not found")]
    NotFound {
        /// Object identity (`kind namespace/name`)
        key: String,
    },

    /// An object with the same identity already exists
    #[error("{key} already exists")]
    AlreadyExists {
        /// Object identity (`kind namespace/name`)
        key: String,
    },

    /// The store refused the request
    #[error("forbidden: {key}: {message}")]
    Forbidden {
        /// Object identity (`kind namespace/name`)
        key: String,
        /// Message returned by the store
        message: String,
    },

    /// Optimistic-lock failure: the object changed since it was read
    #[error("conflict on {key}: {message}")]
    Conflict {
        /// Object identity (`kind namespace/name`)
        key: String,
        /// Message returned by the store
        message: String,
    },

    /// Transport, permission or any other store failure
    #[error("store error [{operation}]: {message}")]
    Store {
        /// Store operation that failed (get, list, create, ...)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A provider invariant would be violated
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violated invariant
        message: String,
    },

    /// A bounded poll ran out of time
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Last observed state
        message: String,
    },

    /// Malformed input rejected before any I/O
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being converted (if known)
        kind: Option<String>,
    },

    /// An error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        /// Operation and object being worked on
        context: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a store error for an operation
    pub fn store(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for an operation
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap this error with a description of the operation being attempted
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the object was absent
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    /// Whether the object already existed
    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    /// Whether the store refused the request
    pub fn is_forbidden(&self) -> bool {
        matches!(self.root(), Error::Forbidden { .. })
    }

    /// Whether an optimistic-lock check failed
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound { key: ae.message },
                409 if ae.reason == "AlreadyExists" => Error::AlreadyExists { key: ae.message },
                409 => Error::Conflict {
                    key: ae.reason,
                    message: ae.message,
                },
                403 => Error::Forbidden {
                    key: ae.reason,
                    message: ae.message,
                },
                _ => Error::store(ae.reason, ae.message),
            },
            other => Error::store("request", other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

/// Annotate a fallible result with the operation being attempted
pub trait ErrorContext<T> {
    /// Wrap the error, if any, with a lazily built context message
    fn context_with<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn context_with<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
